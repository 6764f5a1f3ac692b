//! Event system for the verification pipeline.
//!
//! Provides hooks for metrics, logging, and custom reactions around pipeline
//! activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::extraction::VerdictStatus;
use crate::pipeline::{FailureKind, Outcome, Stage};

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub request_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StageFailureEvent {
    pub request_id: String,
    pub stage: Stage,
    pub kind: FailureKind,
    pub attempt: u32,
    pub retryable: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub request_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub reason: FailureKind,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Terminal summary of one request.
#[derive(Debug, Clone)]
pub struct FinishedEvent {
    pub request_id: String,
    pub status: Option<VerdictStatus>,
    pub persisted: bool,
    pub failure: Option<(Stage, FailureKind)>,
    pub attempts: u32,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

impl FinishedEvent {
    pub fn new(request_id: &str, outcome: &Outcome, attempts: u32, latency: Duration) -> Self {
        let (status, persisted, failure) = match outcome {
            Outcome::Success { verdict, persisted } => (Some(verdict.status), *persisted, None),
            Outcome::Failure { kind, stage, .. } => (None, false, Some((*stage, *kind))),
        };
        Self {
            request_id: request_id.to_string(),
            status,
            persisted,
            failure,
            attempts,
            latency,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RequestStarted(RequestEvent),
    AttemptStarted(AttemptEvent),
    StageFailed(StageFailureEvent),
    Retry(RetryEvent),
    PersistenceFailed(StageFailureEvent),
    RequestFinished(FinishedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &PipelineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: PipelineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RequestStarted(start) => {
                log::debug!("{} started", start.request_id);
            }
            PipelineEvent::AttemptStarted(attempt) => {
                log::debug!("{} {} attempt {}", attempt.request_id, attempt.stage, attempt.attempt);
            }
            PipelineEvent::StageFailed(failure) => {
                log::warn!(
                    "{} {} failed ({}, retryable={}): {}",
                    failure.request_id,
                    failure.stage,
                    failure.kind,
                    failure.retryable,
                    failure.message
                );
            }
            PipelineEvent::Retry(retry) => {
                log::info!(
                    "{} retrying {} after attempt {} in {:.2}s ({})",
                    retry.request_id,
                    retry.stage,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            PipelineEvent::PersistenceFailed(failure) => {
                log::warn!(
                    "{} verdict not persisted after {} attempt(s): {}",
                    failure.request_id,
                    failure.attempt,
                    failure.message
                );
            }
            PipelineEvent::RequestFinished(done) => match (&done.status, &done.failure) {
                (Some(status), _) => log::info!(
                    "{} -> {} persisted={} ({:.2}s)",
                    done.request_id,
                    status,
                    done.persisted,
                    done.latency.as_secs_f64()
                ),
                (None, Some((stage, kind))) => log::info!(
                    "{} -> failed {} at {} after {} attempt(s)",
                    done.request_id,
                    kind,
                    stage,
                    done.attempts
                ),
                (None, None) => {}
            },
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageFailed(failure) | PipelineEvent::PersistenceFailed(failure) => {
                self.metrics.record_stage_failure(failure.stage, failure.kind);
            }
            PipelineEvent::Retry(retry) => self.metrics.record_retry(retry.stage),
            PipelineEvent::RequestFinished(done) => {
                self.metrics.record_outcome(done.status, done.persisted, done.latency);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &PipelineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(PipelineEvent::RequestStarted(RequestEvent {
            request_id: "req-1-0".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_failures_and_outcomes() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&PipelineEvent::StageFailed(StageFailureEvent {
            request_id: "req-1-0".into(),
            stage: Stage::PortalSession,
            kind: FailureKind::SessionTimeout,
            attempt: 1,
            retryable: true,
            message: "slow".into(),
            timestamp: Utc::now(),
        }));
        handler.handle(&PipelineEvent::RequestFinished(FinishedEvent::new(
            "req-1-0",
            &Outcome::Failure {
                kind: FailureKind::SessionTimeout,
                stage: Stage::PortalSession,
                attempts: 1,
                message: "slow".into(),
            },
            1,
            Duration::from_millis(40),
        )));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.failures, 1);
        assert_eq!(snapshot.failures_for(FailureKind::SessionTimeout), 1);
    }
}
