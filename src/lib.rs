//! # imei-verifier
//!
//! Async IMEI compliance checks against the DIRBS device-registration portal.
//!
//! A request flows through validation, a fresh portal session (solving the
//! captcha in front of the lookup form), verdict extraction, and persistence.
//! Every request ends in exactly one [`Outcome`]: a verdict or a classified
//! failure naming the stage and the number of attempts made.
//!
//! ## Features
//!
//! - 14-16 digit identifiers with Luhn check digit validation
//! - Image captcha and reCAPTCHA solving through 2Captcha or CapMonster
//! - Retries with growing backoff and a fresh session per attempt
//! - Bounded concurrent portal sessions and a per-request deadline
//! - Memory, redb, or Supabase storage with history lookup
//! - Event hooks feeding logs and metrics
//! - Optional axum router (`server` feature)
//!
//! ## Example
//!
//! ```no_run
//! use imei_verifier::{ImeiVerifier, Outcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let verifier = ImeiVerifier::from_env()?;
//!     match verifier.verify("359871977331199").await {
//!         Outcome::Success { verdict, .. } => println!("{}", verdict.status),
//!         Outcome::Failure { kind, stage, .. } => println!("{kind} at {stage}"),
//!     }
//!     Ok(())
//! }
//! ```

mod verifier;

pub mod api;
pub mod challenges;
pub mod config;
pub mod external_deps;
pub mod extraction;
pub mod identifier;
pub mod modules;
pub mod persistence;
pub mod pipeline;
pub mod portal;

pub use crate::verifier::{
	Health,
	ImeiVerifier,
	ImeiVerifierBuilder,
	VerifierError,
	VerifierResult,
};

pub use crate::config::{CaptchaService, ConfigError, StorageSettings, VerifierConfig};

pub use crate::identifier::{Identifier, ValidationError};

pub use crate::challenges::core::{Challenge, ChallengeKind, ProofToken};
pub use crate::challenges::{ChallengeResolver, ResolutionError};

pub use crate::external_deps::captcha::{
	CaptchaConfig,
	CaptchaError,
	CaptchaProvider,
	CaptchaSolution,
};

pub use crate::portal::{
	BrowserError,
	BrowserSession,
	PortalPage,
	PortalSessionDriver,
	RawResult,
	SessionError,
};

pub use crate::extraction::{ExtractionError, VerdictStatus, VerificationVerdict};

pub use crate::persistence::{Ack, PersistenceGateway, StorageBackend, StorageError};

pub use crate::pipeline::{
	FailureKind,
	Outcome,
	OverflowPolicy,
	RetryPolicy,
	Stage,
	StageRetry,
	VerificationPipeline,
	VerificationRequest,
};

pub use crate::modules::{EventHandler, MetricsCollector, MetricsSnapshot, PipelineEvent};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
