//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Builder pattern
//! - TOML/JSON/file loading
//! - Environment overrides compatible with the service's variables
//! - Validation of credentials and bounds

pub mod settings;

pub use settings::{
    CaptchaService, CaptchaSettings, ConcurrencySettings, ConfigError, PortalSettings,
    RetrySettings, StageRetrySettings, StorageSettings, TimeoutSettings, VerifierConfig,
    VerifierConfigBuilder,
};
