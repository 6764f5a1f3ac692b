//! Verification pipeline orchestrator.
//!
//! Sequences validation, the portal session (with challenge resolution),
//! extraction, and persistence for one request, applying the retry policy
//! and producing exactly one terminal [`Outcome`].

pub mod backoff;

pub use backoff::{Backoff, RetryPolicy, StageRetry};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::challenges::{ChallengeResolver, SingleUseProof};
use crate::extraction::{ResultExtractor, VerificationVerdict};
use crate::identifier::{self, Identifier};
use crate::modules::events::{
    AttemptEvent, EventDispatcher, EventHandler, FinishedEvent, PipelineEvent, RequestEvent,
    RetryEvent, StageFailureEvent,
};
use crate::persistence::PersistenceGateway;
use crate::portal::PortalSessionDriver;

/// Classified reason a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidLength,
    InvalidChecksum,
    ResolutionTimeout,
    BackendRejected,
    ResolverUnavailable,
    NoProvider,
    BudgetExhausted,
    ChallengeRejected,
    SessionTimeout,
    PortalError,
    Navigation,
    TokenExpired,
    Blocked,
    UnrecognizedFormat,
    StorageTransient,
    StorageRejected,
    StorageCorrupt,
    Busy,
    DeadlineExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidLength => "invalid_length",
            FailureKind::InvalidChecksum => "invalid_checksum",
            FailureKind::ResolutionTimeout => "resolution_timeout",
            FailureKind::BackendRejected => "backend_rejected",
            FailureKind::ResolverUnavailable => "resolver_unavailable",
            FailureKind::NoProvider => "no_provider",
            FailureKind::BudgetExhausted => "budget_exhausted",
            FailureKind::ChallengeRejected => "challenge_rejected",
            FailureKind::SessionTimeout => "session_timeout",
            FailureKind::PortalError => "portal_error",
            FailureKind::Navigation => "navigation",
            FailureKind::TokenExpired => "token_expired",
            FailureKind::Blocked => "blocked",
            FailureKind::UnrecognizedFormat => "unrecognized_format",
            FailureKind::StorageTransient => "storage_transient",
            FailureKind::StorageRejected => "storage_rejected",
            FailureKind::StorageCorrupt => "storage_corrupt",
            FailureKind::Busy => "busy",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Admission,
    Validation,
    ChallengeResolution,
    PortalSession,
    Extraction,
    Persistence,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Admission => "admission",
            Stage::Validation => "validation",
            Stage::ChallengeResolution => "challenge_resolution",
            Stage::PortalSession => "portal_session",
            Stage::Extraction => "extraction",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// One caller request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    request_id: String,
    identifier: String,
    submitted_at: DateTime<Utc>,
    deadline: Option<Duration>,
}

impl VerificationRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        let submitted_at = Utc::now();
        let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            request_id: format!("req-{}-{seq}", submitted_at.timestamp_millis()),
            identifier: identifier.into(),
            submitted_at,
            deadline: None,
        }
    }

    /// Override the pipeline's request deadline for this request only.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Raw identifier as submitted, before normalization.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

/// Terminal result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        verdict: VerificationVerdict,
        persisted: bool,
    },
    Failure {
        kind: FailureKind,
        stage: Stage,
        attempts: u32,
        message: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn verdict(&self) -> Option<&VerificationVerdict> {
        match self {
            Outcome::Success { verdict, .. } => Some(verdict),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// One executed stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttempt {
    pub stage: Stage,
    pub attempt: u32,
    pub error: Option<FailureKind>,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Mutable bookkeeping for one run; dropped with the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub request_id: String,
    pub stage: Stage,
    /// Portal session attempts made so far.
    pub attempt_count: u32,
    pub last_error: Option<(FailureKind, String)>,
    pub history: Vec<StageAttempt>,
}

impl AttemptRecord {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            stage: Stage::Validation,
            attempt_count: 0,
            last_error: None,
            history: Vec::new(),
        }
    }

    fn begin(&mut self, stage: Stage, attempt: u32) {
        self.stage = stage;
        self.history.push(StageAttempt {
            stage,
            attempt,
            error: None,
            message: None,
            at: Utc::now(),
        });
    }

    fn fail(&mut self, stage: Stage, kind: FailureKind, message: &str) {
        self.stage = stage;
        self.last_error = Some((kind, message.to_string()));
        if let Some(entry) = self.history.last_mut() {
            entry.stage = stage;
            entry.error = Some(kind);
            entry.message = Some(message.to_string());
        }
    }

    fn failure(&self, kind: FailureKind, message: impl Into<String>) -> Outcome {
        Outcome::Failure {
            kind,
            stage: self.stage,
            attempts: self.attempt_count,
            message: message.into(),
        }
    }
}

/// What to do when every session slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for a slot, bounded by the request deadline.
    #[default]
    Queue,
    /// Fail immediately with `Busy`.
    Reject,
}

/// Sequences the stages of one verification.
pub struct VerificationPipeline {
    driver: PortalSessionDriver,
    resolver: Arc<ChallengeResolver>,
    extractor: ResultExtractor,
    gateway: PersistenceGateway,
    retry: RetryPolicy,
    resolution_budget: Duration,
    request_deadline: Duration,
    storage_timeout: Duration,
    admission: Arc<Semaphore>,
    max_concurrent: usize,
    overflow: OverflowPolicy,
    events: EventDispatcher,
}

impl fmt::Debug for VerificationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationPipeline")
            .field("driver", &self.driver)
            .field("resolver", &self.resolver)
            .field("gateway", &self.gateway)
            .field("retry", &self.retry)
            .field("resolution_budget", &self.resolution_budget)
            .field("request_deadline", &self.request_deadline)
            .field("storage_timeout", &self.storage_timeout)
            .field("max_concurrent", &self.max_concurrent)
            .field("overflow", &self.overflow)
            .finish()
    }
}

const DEFAULT_MAX_CONCURRENT: usize = 4;

impl VerificationPipeline {
    pub fn new(
        driver: PortalSessionDriver,
        resolver: Arc<ChallengeResolver>,
        gateway: PersistenceGateway,
    ) -> Self {
        Self {
            driver,
            resolver,
            extractor: ResultExtractor::new(),
            gateway,
            retry: RetryPolicy::default(),
            resolution_budget: Duration::from_secs(120),
            request_deadline: Duration::from_secs(300),
            storage_timeout: Duration::from_secs(10),
            admission: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            overflow: OverflowPolicy::Queue,
            events: EventDispatcher::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_resolution_budget(mut self, budget: Duration) -> Self {
        self.resolution_budget = budget;
        self
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    /// Bound on a single storage attempt.
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self.admission = Arc::new(Semaphore::new(self.max_concurrent));
        self
    }

    pub fn with_overflow_policy(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events.register_handler(handler);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    /// Session slots currently free.
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    /// Run one request to its terminal outcome.
    ///
    /// The deadline bounds admission, the session and extraction. Persistence
    /// runs inside what is left of it; when the deadline expires there the
    /// verdict is still returned with `persisted: false`.
    ///
    /// Dropping the returned future cancels the request; any open session is
    /// closed in the background.
    pub async fn run(&self, request: VerificationRequest) -> Outcome {
        let started = Instant::now();
        self.events.dispatch(PipelineEvent::RequestStarted(RequestEvent {
            request_id: request.request_id().to_string(),
            timestamp: Utc::now(),
        }));

        let mut record = AttemptRecord::new(request.request_id());
        let deadline = request.deadline().unwrap_or(self.request_deadline);
        let deadline_at = tokio::time::Instant::now() + deadline;

        let verified = tokio::time::timeout_at(deadline_at, self.verify(&request, &mut record)).await;
        let outcome = match verified {
            Ok(Ok(verdict)) => {
                let stored = tokio::time::timeout_at(
                    deadline_at,
                    self.persist_with_retries(&verdict, &mut record),
                )
                .await;
                let persisted = match stored {
                    Ok(persisted) => persisted,
                    Err(_) => {
                        log::warn!("{} hit its deadline while storing the verdict", record.request_id);
                        let message =
                            format!("request deadline of {deadline:?} exceeded while storing");
                        self.persistence_abandoned(&mut record, FailureKind::DeadlineExceeded, message);
                        false
                    }
                };
                log::info!(
                    "{} finished: {} for {} (persisted={persisted})",
                    record.request_id,
                    verdict.status,
                    verdict.identifier
                );
                Outcome::Success { verdict, persisted }
            }
            Ok(Err(outcome)) => outcome,
            Err(_) => {
                log::warn!(
                    "{} exceeded its {deadline:?} deadline during {}",
                    record.request_id,
                    record.stage
                );
                let message = format!("request deadline of {deadline:?} exceeded");
                record.fail(record.stage, FailureKind::DeadlineExceeded, &message);
                record.failure(FailureKind::DeadlineExceeded, message)
            }
        };

        self.events.dispatch(PipelineEvent::RequestFinished(FinishedEvent::new(
            &record.request_id,
            &outcome,
            record.attempt_count,
            started.elapsed(),
        )));
        outcome
    }

    /// Validation, admission, session and extraction. The session slot is
    /// released before persistence starts.
    async fn verify(
        &self,
        request: &VerificationRequest,
        record: &mut AttemptRecord,
    ) -> Result<VerificationVerdict, Outcome> {
        record.begin(Stage::Validation, 1);
        let identifier = match identifier::validate(request.identifier()) {
            Ok(identifier) => identifier,
            Err(err) => {
                let message = err.to_string();
                record.fail(Stage::Validation, err.failure_kind(), &message);
                self.stage_failed(record, Stage::Validation, err.failure_kind(), &message, false);
                return Err(record.failure(err.failure_kind(), message));
            }
        };

        record.begin(Stage::Admission, 1);
        let _permit = match self.admit().await {
            Some(permit) => permit,
            None => {
                let message = format!("all {} session slots are busy", self.max_concurrent);
                record.fail(Stage::Admission, FailureKind::Busy, &message);
                self.stage_failed(record, Stage::Admission, FailureKind::Busy, &message, false);
                return Err(record.failure(FailureKind::Busy, message));
            }
        };

        self.verify_with_retries(&identifier, record).await
    }

    async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.admission);
        match self.overflow {
            OverflowPolicy::Reject => semaphore.try_acquire_owned().ok(),
            OverflowPolicy::Queue => semaphore.acquire_owned().await.ok(),
        }
    }

    /// Session + extraction with the session retry budget.
    async fn verify_with_retries(
        &self,
        identifier: &Identifier,
        record: &mut AttemptRecord,
    ) -> Result<VerificationVerdict, Outcome> {
        let policy = self.retry.session;
        let mut backoff = Backoff::new(policy);

        loop {
            record.attempt_count += 1;
            let attempt = record.attempt_count;
            record.begin(Stage::PortalSession, attempt);
            self.events.dispatch(PipelineEvent::AttemptStarted(AttemptEvent {
                request_id: record.request_id.clone(),
                stage: Stage::PortalSession,
                attempt,
                timestamp: Utc::now(),
            }));

            let proof = SingleUseProof::new(Arc::clone(&self.resolver), self.resolution_budget);
            let (stage, kind, retryable, message) =
                match self.driver.submit(identifier, &proof).await {
                    Ok(raw) => {
                        record.begin(Stage::Extraction, attempt);
                        match self.extractor.extract(&raw, identifier) {
                            Ok(verdict) => return Ok(verdict),
                            Err(err) => (
                                Stage::Extraction,
                                err.failure_kind(),
                                err.is_retryable(),
                                err.to_string(),
                            ),
                        }
                    }
                    Err(err) => (err.stage(), err.failure_kind(), err.is_retryable(), err.to_string()),
                };

            record.fail(stage, kind, &message);
            self.stage_failed(record, stage, kind, &message, retryable);

            if !retryable || attempt >= policy.max_attempts {
                log::warn!(
                    "{} giving up after {attempt} attempt(s): {kind} at {stage}",
                    record.request_id
                );
                return Err(record.failure(kind, message));
            }

            let delay = backoff.next_delay();
            self.events.dispatch(PipelineEvent::Retry(RetryEvent {
                request_id: record.request_id.clone(),
                stage,
                attempt,
                reason: kind,
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(delay).await;
        }
    }

    /// Store with its own budget. Failure is reported, never fatal.
    async fn persist_with_retries(
        &self,
        verdict: &VerificationVerdict,
        record: &mut AttemptRecord,
    ) -> bool {
        let policy = self.retry.storage;
        let mut backoff = Backoff::new(policy);
        let mut attempt = 0;

        loop {
            attempt += 1;
            record.begin(Stage::Persistence, attempt);

            let (kind, retryable, message) =
                match tokio::time::timeout(self.storage_timeout, self.gateway.store(verdict)).await {
                    Ok(Ok(_)) => return true,
                    Ok(Err(err)) => (err.failure_kind(), err.is_retryable(), err.to_string()),
                    Err(_) => (
                        FailureKind::StorageTransient,
                        true,
                        format!("storage did not answer within {:?}", self.storage_timeout),
                    ),
                };

            if !retryable || attempt >= policy.max_attempts {
                log::warn!(
                    "{} could not persist verdict after {attempt} attempt(s): {message}",
                    record.request_id
                );
                self.persistence_abandoned(record, kind, message);
                return false;
            }

            record.fail(Stage::Persistence, kind, &message);
            self.stage_failed(record, Stage::Persistence, kind, &message, true);
            let delay = backoff.next_delay();
            self.events.dispatch(PipelineEvent::Retry(RetryEvent {
                request_id: record.request_id.clone(),
                stage: Stage::Persistence,
                attempt,
                reason: kind,
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(delay).await;
        }
    }

    fn persistence_abandoned(&self, record: &mut AttemptRecord, kind: FailureKind, message: String) {
        record.fail(Stage::Persistence, kind, &message);
        let attempt = record.history.last().map(|entry| entry.attempt).unwrap_or(0);
        self.events.dispatch(PipelineEvent::PersistenceFailed(StageFailureEvent {
            request_id: record.request_id.clone(),
            stage: Stage::Persistence,
            kind,
            attempt,
            retryable: false,
            message,
            timestamp: Utc::now(),
        }));
    }

    fn stage_failed(
        &self,
        record: &AttemptRecord,
        stage: Stage,
        kind: FailureKind,
        message: &str,
        retryable: bool,
    ) {
        let attempt = record.history.last().map(|entry| entry.attempt).unwrap_or(0);
        self.events.dispatch(PipelineEvent::StageFailed(StageFailureEvent {
            request_id: record.request_id.clone(),
            stage,
            kind,
            attempt,
            retryable,
            message: message.to_string(),
            timestamp: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = VerificationRequest::new("359871977331199");
        let b = VerificationRequest::new("359871977331199");
        assert!(a.request_id().starts_with("req-"));
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(a.identifier(), "359871977331199");
        assert_eq!(a.deadline(), None);
        let c = a.with_deadline(Duration::from_secs(5));
        assert_eq!(c.deadline(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn failure_kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&FailureKind::SessionTimeout).unwrap(),
            "\"session_timeout\""
        );
        assert_eq!(FailureKind::DeadlineExceeded.to_string(), "deadline_exceeded");
        assert_eq!(
            serde_json::to_string(&Stage::ChallengeResolution).unwrap(),
            "\"challenge_resolution\""
        );
    }

    #[test]
    fn record_failure_reports_current_stage_and_attempts() {
        let mut record = AttemptRecord::new("req-1-0");
        record.attempt_count = 2;
        record.begin(Stage::PortalSession, 2);
        record.fail(Stage::ChallengeResolution, FailureKind::ResolutionTimeout, "slow");

        let outcome = record.failure(FailureKind::ResolutionTimeout, "slow");
        assert_eq!(
            outcome,
            Outcome::Failure {
                kind: FailureKind::ResolutionTimeout,
                stage: Stage::ChallengeResolution,
                attempts: 2,
                message: "slow".into(),
            }
        );
        assert_eq!(record.history[0].error, Some(FailureKind::ResolutionTimeout));
    }
}
