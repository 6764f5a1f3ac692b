//! Challenge resolution.
//!
//! Routes each challenge to the captcha provider registered for its kind and
//! bounds the solve by a time budget. Tokens are handed out once and never
//! cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::challenges::core::{Challenge, ChallengeKind, DEFAULT_TOKEN_TTL, ProofToken};
use crate::external_deps::captcha::{CaptchaError, CaptchaProvider};
use crate::pipeline::FailureKind;

/// Failures while obtaining a proof token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("challenge not solved within {0:?}")]
    Timeout(Duration),
    #[error("solving backend rejected the challenge: {0}")]
    BackendRejected(String),
    #[error("solving backend unavailable: {0}")]
    Unavailable(String),
    #[error("no captcha provider configured for {0} challenges")]
    NoProvider(ChallengeKind),
    #[error("challenge budget for this attempt already spent")]
    BudgetExhausted,
}

impl ResolutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolutionError::Timeout(_)
                | ResolutionError::BackendRejected(_)
                | ResolutionError::Unavailable(_)
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ResolutionError::Timeout(_) => FailureKind::ResolutionTimeout,
            ResolutionError::BackendRejected(_) => FailureKind::BackendRejected,
            ResolutionError::Unavailable(_) => FailureKind::ResolverUnavailable,
            ResolutionError::NoProvider(_) => FailureKind::NoProvider,
            ResolutionError::BudgetExhausted => FailureKind::BudgetExhausted,
        }
    }
}

/// Dispatches challenges to captcha providers.
#[derive(Clone, Default)]
pub struct ChallengeResolver {
    default_provider: Option<Arc<dyn CaptchaProvider>>,
    by_kind: HashMap<ChallengeKind, Arc<dyn CaptchaProvider>>,
}

impl std::fmt::Debug for ChallengeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: HashMap<_, _> = self
            .by_kind
            .iter()
            .map(|(kind, provider)| (kind.to_string(), provider.name()))
            .collect();
        f.debug_struct("ChallengeResolver")
            .field("default", &self.default_provider.as_ref().map(|p| p.name()))
            .field("routes", &routes)
            .finish()
    }
}

impl ChallengeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.default_provider = Some(provider);
        self
    }

    pub fn with_provider(mut self, kind: ChallengeKind, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.by_kind.insert(kind, provider);
        self
    }

    pub fn with_image_provider(self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.with_provider(ChallengeKind::StaticImage, provider)
    }

    pub fn with_interactive_provider(self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.with_provider(ChallengeKind::Interactive, provider)
    }

    /// Whether any provider is registered at all.
    pub fn is_configured(&self) -> bool {
        self.default_provider.is_some() || !self.by_kind.is_empty()
    }

    /// Provider that will handle `kind`: the kind-specific one, else the default
    /// if it supports the kind.
    pub fn provider_for(&self, kind: ChallengeKind) -> Option<&Arc<dyn CaptchaProvider>> {
        self.by_kind
            .get(&kind)
            .or(self.default_provider.as_ref())
            .filter(|provider| provider.supports(kind))
    }

    /// Solve `challenge` within `budget`, consuming it.
    pub async fn resolve(
        &self,
        challenge: Challenge,
        budget: Duration,
    ) -> Result<ProofToken, ResolutionError> {
        let kind = challenge.kind();
        let provider = self
            .provider_for(kind)
            .ok_or(ResolutionError::NoProvider(kind))?;

        log::debug!("resolving {kind} challenge via {}", provider.name());
        let solved = tokio::time::timeout(budget, provider.solve(&challenge)).await;

        let solution = match solved {
            Err(_) => {
                log::warn!("{} did not solve {kind} challenge within {budget:?}", provider.name());
                return Err(ResolutionError::Timeout(budget));
            }
            Ok(result) => result.map_err(|err| map_captcha_error(err, kind, budget))?,
        };

        if solution.token.is_empty() {
            return Err(ResolutionError::BackendRejected("empty token".into()));
        }

        let ttl = solution.expires_in.unwrap_or(DEFAULT_TOKEN_TTL);
        Ok(ProofToken::new(solution.token, ttl))
    }
}

fn map_captcha_error(err: CaptchaError, kind: ChallengeKind, budget: Duration) -> ResolutionError {
    match err {
        CaptchaError::Unsolvable(reason) => ResolutionError::BackendRejected(reason),
        CaptchaError::Timeout(_) => ResolutionError::Timeout(budget),
        CaptchaError::Unsupported(kind) => ResolutionError::NoProvider(kind),
        CaptchaError::Configuration(reason) => {
            log::warn!("captcha provider misconfigured: {reason}");
            ResolutionError::NoProvider(kind)
        }
        CaptchaError::Provider(reason) | CaptchaError::Other(reason) => {
            ResolutionError::Unavailable(reason)
        }
    }
}

/// Callback the portal session uses when it meets a challenge.
#[async_trait]
pub trait ProofProvider: Send + Sync {
    async fn provide(&self, challenge: Challenge) -> Result<ProofToken, ResolutionError>;
}

/// Proof provider scoped to one attempt: one solve, fixed budget.
#[derive(Debug)]
pub struct SingleUseProof {
    resolver: Arc<ChallengeResolver>,
    budget: Duration,
    spent: AtomicBool,
}

impl SingleUseProof {
    pub fn new(resolver: Arc<ChallengeResolver>, budget: Duration) -> Self {
        Self {
            resolver,
            budget,
            spent: AtomicBool::new(false),
        }
    }

    pub fn is_spent(&self) -> bool {
        self.spent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofProvider for SingleUseProof {
    async fn provide(&self, challenge: Challenge) -> Result<ProofToken, ResolutionError> {
        if self.spent.swap(true, Ordering::SeqCst) {
            return Err(ResolutionError::BudgetExhausted);
        }
        self.resolver.resolve(challenge, self.budget).await
    }
}
