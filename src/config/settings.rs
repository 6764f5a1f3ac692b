use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::pipeline::{OverflowPolicy, RetryPolicy, StageRetry};

const DEFAULT_PORTAL_URL: &str = "https://dirbs.pta.gov.pk/";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("missing credential {0}")]
    MissingCredential(&'static str),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Captcha solving backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptchaService {
    #[default]
    #[serde(rename = "2captcha", alias = "twocaptcha")]
    TwoCaptcha,
    #[serde(rename = "capmonster")]
    CapMonster,
}

impl CaptchaService {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "2captcha" | "twocaptcha" => Some(CaptchaService::TwoCaptcha),
            "capmonster" => Some(CaptchaService::CapMonster),
            _ => None,
        }
    }

    /// Environment variable holding this backend's key.
    pub fn credential_name(&self) -> &'static str {
        match self {
            CaptchaService::TwoCaptcha => "CAPTCHA_API_KEY_2CAPTCHA",
            CaptchaService::CapMonster => "CAPTCHA_API_KEY_CAPMONSTER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSettings {
    pub url: Url,
    pub user_agent: Option<String>,
    pub navigation_timeout_ms: u64,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_PORTAL_URL).expect("invalid default portal url"),
            user_agent: None,
            navigation_timeout_ms: 30_000,
        }
    }
}

impl PortalSettings {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    /// Default backend for every challenge kind.
    pub service: CaptchaService,
    /// Overrides for image challenges.
    pub image_service: Option<CaptchaService>,
    /// Overrides for interactive challenges.
    pub interactive_service: Option<CaptchaService>,
    pub two_captcha_key: Option<String>,
    pub capmonster_key: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            service: CaptchaService::TwoCaptcha,
            image_service: None,
            interactive_service: None,
            two_captcha_key: None,
            capmonster_key: None,
            poll_interval_ms: 2_000,
        }
    }
}

impl CaptchaSettings {
    /// Every backend some challenge kind is routed to.
    pub fn services_in_use(&self) -> Vec<CaptchaService> {
        let mut services = vec![self.service];
        for service in [self.image_service, self.interactive_service].into_iter().flatten() {
            if !services.contains(&service) {
                services.push(service);
            }
        }
        services
    }

    pub fn key_for(&self, service: CaptchaService) -> Option<&str> {
        match service {
            CaptchaService::TwoCaptcha => self.two_captcha_key.as_deref(),
            CaptchaService::CapMonster => self.capmonster_key.as_deref(),
        }
        .filter(|key| !key.trim().is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl StageRetrySettings {
    fn from_stage(stage: StageRetry) -> Self {
        Self {
            max_attempts: stage.max_attempts,
            base_delay_ms: stage.base_delay.as_millis() as u64,
            max_delay_ms: stage.max_delay.as_millis() as u64,
            multiplier: stage.multiplier,
            jitter: stage.jitter,
        }
    }

    pub fn to_stage_retry(&self) -> StageRetry {
        StageRetry::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter)
    }
}

impl Default for StageRetrySettings {
    fn default() -> Self {
        Self::from_stage(RetryPolicy::default().session)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub session: StageRetrySettings,
    pub storage: StageRetrySettings,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            session: StageRetrySettings::from_stage(policy.session),
            storage: StageRetrySettings::from_stage(policy.storage),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            session: self.session.to_stage_retry(),
            storage: self.storage.to_stage_retry(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Budget for solving one challenge.
    pub resolution_ms: u64,
    /// Wait for the result banner after submission.
    pub result_render_ms: u64,
    /// Wall clock for a whole request; cancels everything inside it.
    pub request_ms: u64,
    /// One storage attempt.
    pub storage_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            resolution_ms: 120_000,
            result_render_ms: 10_000,
            request_ms: 300_000,
            storage_ms: 10_000,
        }
    }
}

impl TimeoutSettings {
    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms)
    }

    pub fn result_render(&self) -> Duration {
        Duration::from_millis(self.result_render_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn storage(&self) -> Duration {
        Duration::from_millis(self.storage_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub max_concurrent_sessions: usize,
    pub overflow: OverflowPolicy,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            overflow: OverflowPolicy::Queue,
        }
    }
}

fn default_table() -> String {
    "imei_verification_results".to_string()
}

/// Where verdicts are written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageSettings {
    #[default]
    Memory,
    Redb {
        path: PathBuf,
    },
    Supabase {
        url: Url,
        api_key: String,
        #[serde(default = "default_table")]
        table: String,
    },
}

/// Complete verifier configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub portal: PortalSettings,
    pub captcha: CaptchaSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub concurrency: ConcurrencySettings,
    pub storage: StorageSettings,
}

impl VerifierConfig {
    pub fn builder() -> VerifierConfigBuilder {
        VerifierConfigBuilder::new()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("toml") => Self::from_toml_str(&raw),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from an environment-like lookup.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get("PTA_URL") {
            self.portal.url = Url::parse(url.trim()).map_err(|err| invalid("PTA_URL", err.to_string()))?;
        }
        if let Some(service) = get("CAPTCHA_SERVICE") {
            self.captcha.service = CaptchaService::parse(&service)
                .ok_or_else(|| invalid("CAPTCHA_SERVICE", format!("unknown service {service:?}")))?;
        }
        if let Some(key) = get("CAPTCHA_API_KEY_2CAPTCHA") {
            self.captcha.two_captcha_key = Some(key);
        }
        if let Some(key) = get("CAPTCHA_API_KEY_CAPMONSTER") {
            self.captcha.capmonster_key = Some(key);
        }

        if let Some(url) = get("SUPABASE_URL") {
            let url = Url::parse(url.trim()).map_err(|err| invalid("SUPABASE_URL", err.to_string()))?;
            let api_key = get("SUPABASE_ANON_KEY").unwrap_or_default();
            self.storage = StorageSettings::Supabase {
                url,
                api_key,
                table: default_table(),
            };
        } else if let Some(path) = get("VERIFIER_REDB_PATH") {
            self.storage = StorageSettings::Redb { path: path.into() };
        }

        if let Some(value) = get("VERIFIER_MAX_ATTEMPTS") {
            self.retry.session.max_attempts = parse_number("VERIFIER_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("VERIFIER_STORAGE_MAX_ATTEMPTS") {
            self.retry.storage.max_attempts = parse_number("VERIFIER_STORAGE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("VERIFIER_MAX_CONCURRENT_SESSIONS") {
            self.concurrency.max_concurrent_sessions =
                parse_number("VERIFIER_MAX_CONCURRENT_SESSIONS", &value)?;
        }
        if let Some(value) = get("VERIFIER_OVERFLOW") {
            self.concurrency.overflow = match value.trim().to_ascii_lowercase().as_str() {
                "queue" => OverflowPolicy::Queue,
                "reject" => OverflowPolicy::Reject,
                other => return Err(invalid("VERIFIER_OVERFLOW", format!("unknown policy {other:?}"))),
            };
        }
        if let Some(value) = get("VERIFIER_RESOLUTION_TIMEOUT_SECS") {
            let secs: u64 = parse_number("VERIFIER_RESOLUTION_TIMEOUT_SECS", &value)?;
            self.timeouts.resolution_ms = secs * 1_000;
        }
        if let Some(value) = get("VERIFIER_RESULT_TIMEOUT_SECS") {
            let secs: u64 = parse_number("VERIFIER_RESULT_TIMEOUT_SECS", &value)?;
            self.timeouts.result_render_ms = secs * 1_000;
        }
        if let Some(value) = get("VERIFIER_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_number("VERIFIER_REQUEST_TIMEOUT_SECS", &value)?;
            self.timeouts.request_ms = secs * 1_000;
        }
        if let Some(value) = get("VERIFIER_STORAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_number("VERIFIER_STORAGE_TIMEOUT_SECS", &value)?;
            self.timeouts.storage_ms = secs * 1_000;
        }

        Ok(self)
    }

    /// Check credentials and bounds before wiring anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_bounds()?;

        for service in self.captcha.services_in_use() {
            if self.captcha.key_for(service).is_none() {
                return Err(ConfigError::MissingCredential(service.credential_name()));
            }
        }

        if let StorageSettings::Supabase { api_key, .. } = &self.storage
            && api_key.trim().is_empty()
        {
            return Err(ConfigError::MissingCredential("SUPABASE_ANON_KEY"));
        }

        Ok(())
    }

    /// Everything except credentials.
    pub fn validate_bounds(&self) -> Result<(), ConfigError> {
        if !matches!(self.portal.url.scheme(), "http" | "https") {
            return Err(invalid("portal.url", "must be http(s)"));
        }

        if self.retry.session.max_attempts == 0 {
            return Err(invalid("retry.session.max_attempts", "must be at least 1"));
        }
        if self.retry.storage.max_attempts == 0 {
            return Err(invalid("retry.storage.max_attempts", "must be at least 1"));
        }
        if self.concurrency.max_concurrent_sessions == 0 {
            return Err(invalid("concurrency.max_concurrent_sessions", "must be at least 1"));
        }
        if self.timeouts.resolution_ms == 0
            || self.timeouts.result_render_ms == 0
            || self.timeouts.request_ms == 0
            || self.timeouts.storage_ms == 0
        {
            return Err(invalid("timeouts", "must be non-zero"));
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected a number, got {raw:?}")))
}

/// Fluent builder over [`VerifierConfig`].
#[derive(Debug, Clone, Default)]
pub struct VerifierConfigBuilder {
    config: VerifierConfig,
}

impl VerifierConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_portal_url(mut self, url: Url) -> Self {
        self.config.portal.url = url;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.portal.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_captcha_service(mut self, service: CaptchaService) -> Self {
        self.config.captcha.service = service;
        self
    }

    pub fn with_two_captcha_key(mut self, key: impl Into<String>) -> Self {
        self.config.captcha.two_captcha_key = Some(key.into());
        self
    }

    pub fn with_capmonster_key(mut self, key: impl Into<String>) -> Self {
        self.config.captcha.capmonster_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.session.max_attempts = attempts;
        self
    }

    pub fn with_storage_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.storage.max_attempts = attempts;
        self
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.config.concurrency.max_concurrent_sessions = max;
        self
    }

    pub fn with_overflow_policy(mut self, overflow: OverflowPolicy) -> Self {
        self.config.concurrency.overflow = overflow;
        self
    }

    pub fn with_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.resolution_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.result_render_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.request_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.storage_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_storage(mut self, storage: StorageSettings) -> Self {
        self.config.storage = storage;
        self
    }

    /// Finish without checking credentials; useful when collaborators are injected.
    pub fn build_unchecked(self) -> VerifierConfig {
        self.config
    }

    pub fn build(self) -> Result<VerifierConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
