//! Metrics collection utilities.
//!
//! Provides aggregated request outcomes, per-stage failure counters, and
//! latency percentiles for observability.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::extraction::VerdictStatus;
use crate::pipeline::{FailureKind, Stage};

/// Aggregated metrics across all requests.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub unpersisted: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            unpersisted: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

/// Stage-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct StageStats {
    pub stage: Stage,
    pub failures: u64,
    pub retries: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub stages: Vec<StageStats>,
    pub failure_kinds: Vec<(FailureKind, u64)>,
    pub verdicts: Vec<(VerdictStatus, u64)>,
}

impl MetricsSnapshot {
    pub fn failures_for(&self, kind: FailureKind) -> u64 {
        self.failure_kinds
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageStats> {
        self.stages.iter().find(|stats| stats.stage == stage)
    }
}

#[derive(Debug, Default)]
struct StageAccumulator {
    failures: u64,
    retries: u64,
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    latencies: VecDeque<Duration>,
    stages: HashMap<Stage, StageAccumulator>,
    failure_kinds: HashMap<FailureKind, u64>,
    verdicts: HashMap<VerdictStatus, u64>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            latencies: VecDeque::with_capacity(max_window),
            stages: HashMap::new(),
            failure_kinds: HashMap::new(),
            verdicts: HashMap::new(),
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        self.global.average_latency = Some(Duration::from_secs_f64(avg));
        self.global.p95_latency = Some(samples[p95_index]);
    }
}

/// Thread-safe metrics collector fed by the pipeline's event stream.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_stage_failure(&self, stage: Stage, kind: FailureKind) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.stages.entry(stage).or_default().failures += 1;
        *guard.failure_kinds.entry(kind).or_insert(0) += 1;
    }

    pub fn record_retry(&self, stage: Stage) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.stages.entry(stage).or_default().retries += 1;
    }

    /// Terminal outcome; `status` is `None` for failed requests.
    pub fn record_outcome(&self, status: Option<VerdictStatus>, persisted: bool, latency: Duration) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.total_requests += 1;
        match status {
            Some(status) => {
                guard.global.successes += 1;
                if !persisted {
                    guard.global.unpersisted += 1;
                }
                *guard.verdicts.entry(status).or_insert(0) += 1;
            }
            None => guard.global.failures += 1,
        }
        guard.record_latency(latency);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut stages: Vec<_> = guard
            .stages
            .iter()
            .map(|(stage, acc)| StageStats {
                stage: *stage,
                failures: acc.failures,
                retries: acc.retries,
            })
            .collect();
        stages.sort_by_key(|stats| stats.stage.as_str());
        MetricsSnapshot {
            global: guard.global.clone(),
            stages,
            failure_kinds: guard.failure_kinds.iter().map(|(k, v)| (*k, *v)).collect(),
            verdicts: guard.verdicts.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_outcomes_and_stage_failures() {
        let metrics = MetricsCollector::new();
        metrics.record_stage_failure(Stage::PortalSession, FailureKind::SessionTimeout);
        metrics.record_retry(Stage::PortalSession);
        metrics.record_outcome(Some(VerdictStatus::Compliant), true, Duration::from_millis(150));
        metrics.record_outcome(Some(VerdictStatus::Compliant), false, Duration::from_millis(250));
        metrics.record_outcome(None, false, Duration::from_millis(800));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.total_requests, 3);
        assert_eq!(snapshot.global.successes, 2);
        assert_eq!(snapshot.global.failures, 1);
        assert_eq!(snapshot.global.unpersisted, 1);
        assert_eq!(snapshot.global.p95_latency, Some(Duration::from_millis(800)));

        let session = snapshot.stage(Stage::PortalSession).unwrap();
        assert_eq!((session.failures, session.retries), (1, 1));
        assert_eq!(snapshot.failures_for(FailureKind::SessionTimeout), 1);
    }
}
