//! Captcha provider integrations.
//!
//! These adapters provide a unified interface for third-party captcha
//! solvers such as 2Captcha and CapMonster. The challenge resolver can
//! remain agnostic of vendor-specific details while still retrieving proof
//! tokens for both image and interactive challenges.

mod capmonster;
mod twocaptcha;

pub use capmonster::CapMonsterProvider;
pub use twocaptcha::TwoCaptchaProvider;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::challenges::core::{Challenge, ChallengeKind};

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Resolved captcha token and optional metadata.
#[derive(Debug, Clone)]
pub struct CaptchaSolution {
    pub token: String,
    pub expires_in: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_in: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this provider can handle the given challenge kind.
    fn supports(&self, _kind: ChallengeKind) -> bool {
        true
    }

    async fn solve(&self, challenge: &Challenge) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha reported unsolvable: {0}")]
    Unsolvable(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider does not support {0} challenges")]
    Unsupported(ChallengeKind),
    #[error("captcha error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for CaptchaError {
    fn from(err: reqwest::Error) -> Self {
        CaptchaError::Provider(err.to_string())
    }
}

/// Base64 body for image submissions; both vendors take the raw image this way.
pub(crate) fn encode_image(image: &[u8]) -> String {
    BASE64.encode(image)
}

/// Poll until `check` yields a solution or the configured timeout elapses.
///
/// `check` returns `Ok(None)` while the vendor is still working.
pub(crate) async fn poll_until_ready<F, Fut>(config: &CaptchaConfig, mut check: F) -> CaptchaResult
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<CaptchaSolution>, CaptchaError>>,
{
    let deadline = tokio::time::Instant::now() + config.timeout;
    loop {
        tokio::time::sleep(config.poll_interval).await;
        if let Some(solution) = check().await? {
            return Ok(solution);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CaptchaError::Timeout(config.timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn polling_returns_first_ready_solution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = CaptchaConfig::default();
        let counter = Arc::clone(&calls);
        let solution = poll_until_ready(&config, move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok((n == 2).then(|| CaptchaSolution::new("done")))
            }
        })
        .await
        .expect("solution");
        assert_eq!(solution.token, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out() {
        let config = CaptchaConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
        };
        let err = poll_until_ready(&config, || async { Ok(None) })
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[test]
    fn images_are_base64_encoded() {
        assert_eq!(encode_image(b"png"), "cG5n");
    }
}
