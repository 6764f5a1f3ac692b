//! Core data structures shared across challenge detection, resolution, and the portal session.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use url::Url;

/// Default lifetime applied to proof tokens when the backend does not report one.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(110);

/// Anti-automation challenge presented by the portal before submission.
#[derive(Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Classic distorted-text image; the answer is the text it shows.
    StaticImage { image: Bytes, content_type: String },
    /// Interactive widget (reCAPTCHA style) identified by its site key.
    Interactive { site_key: String, page_url: Url },
}

impl Challenge {
    pub fn static_image(image: impl Into<Bytes>) -> Self {
        Challenge::StaticImage {
            image: image.into(),
            content_type: "image/png".into(),
        }
    }

    pub fn interactive(site_key: impl Into<String>, page_url: Url) -> Self {
        Challenge::Interactive {
            site_key: site_key.into(),
            page_url,
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        match self {
            Challenge::StaticImage { .. } => ChallengeKind::StaticImage,
            Challenge::Interactive { .. } => ChallengeKind::Interactive,
        }
    }
}

// Image bytes are noise in logs; print their size instead.
impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::StaticImage {
                image,
                content_type,
            } => f
                .debug_struct("StaticImage")
                .field("bytes", &image.len())
                .field("content_type", content_type)
                .finish(),
            Challenge::Interactive { site_key, page_url } => f
                .debug_struct("Interactive")
                .field("site_key", site_key)
                .field("page_url", &page_url.as_str())
                .finish(),
        }
    }
}

/// Discriminant of [`Challenge`], used for provider routing and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    StaticImage,
    Interactive,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeKind::StaticImage => f.write_str("static_image"),
            ChallengeKind::Interactive => f.write_str("interactive"),
        }
    }
}

/// Single-use credential proving a challenge was solved.
#[derive(Clone)]
pub struct ProofToken {
    value: String,
    issued_at: Instant,
    ttl: Duration,
}

impl ProofToken {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            issued_at: Instant::now(),
            ttl,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.issued_at.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= self.ttl
    }
}

impl fmt::Debug for ProofToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofToken")
            .field("len", &self.value.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}
