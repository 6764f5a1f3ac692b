//! Cross-cutting services module
//!
//! Observability around the verification pipeline: structured events and
//! the metrics they feed.

pub mod events;
pub mod metrics;

pub use events::{
    AttemptEvent, EventDispatcher, EventHandler, FinishedEvent, LoggingHandler, MetricsHandler,
    PipelineEvent, RequestEvent, RetryEvent, StageFailureEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, StageStats};
