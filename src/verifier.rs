use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::challenges::ChallengeResolver;
use crate::config::{CaptchaService, ConfigError, StorageSettings, VerifierConfig};
use crate::extraction::VerificationVerdict;
use crate::external_deps::captcha::{
	CapMonsterProvider, CaptchaConfig, CaptchaProvider, TwoCaptchaProvider,
};
use crate::identifier::{ValidationError, validate};
use crate::modules::events::{EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::persistence::{
	MemoryStorage, PersistenceGateway, RedbStorage, StorageBackend, StorageError, SupabaseStorage,
};
use crate::pipeline::{Outcome, VerificationPipeline, VerificationRequest};
use crate::portal::{BrowserSession, PortalSessionDriver, ReqwestBrowserSession};

/// Result alias used by the facade.
pub type VerifierResult<T> = Result<T, VerifierError>;

/// Setup and lookup errors surfaced by the facade.
///
/// Verification itself never errors; it always ends in an [`Outcome`].
#[derive(Debug, Error)]
pub enum VerifierError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("invalid identifier: {0}")]
	Validation(#[from] ValidationError),
}

/// Readiness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
	pub ready: bool,
	pub captcha_configured: bool,
	pub storage_backend: &'static str,
	pub available_sessions: usize,
}

/// Builder for [`ImeiVerifier`].
///
/// Collaborators not supplied explicitly are created from the configuration.
pub struct ImeiVerifierBuilder {
	config: VerifierConfig,
	captcha_provider: Option<Arc<dyn CaptchaProvider>>,
	image_provider: Option<Arc<dyn CaptchaProvider>>,
	interactive_provider: Option<Arc<dyn CaptchaProvider>>,
	browser: Option<Arc<dyn BrowserSession>>,
	storage: Option<Arc<dyn StorageBackend>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	enable_metrics: bool,
}

impl ImeiVerifierBuilder {
	pub fn new() -> Self {
		Self {
			config: VerifierConfig::default(),
			captcha_provider: None,
			image_provider: None,
			interactive_provider: None,
			browser: None,
			storage: None,
			handlers: Vec::new(),
			enable_metrics: true,
		}
	}

	pub fn with_config(mut self, config: VerifierConfig) -> Self {
		self.config = config;
		self
	}

	/// Provider used for every challenge kind without a dedicated one.
	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.captcha_provider = Some(provider);
		self
	}

	pub fn with_image_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.image_provider = Some(provider);
		self
	}

	pub fn with_interactive_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.interactive_provider = Some(provider);
		self
	}

	pub fn with_browser(mut self, browser: Arc<dyn BrowserSession>) -> Self {
		self.browser = Some(browser);
		self
	}

	pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
		self.storage = Some(storage);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.enable_metrics = false;
		self
	}

	pub fn build(self) -> VerifierResult<ImeiVerifier> {
		ImeiVerifier::with_builder(self)
	}
}

impl Default for ImeiVerifierBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Entry point: verifies identifiers against the portal and stores verdicts.
pub struct ImeiVerifier {
	config: VerifierConfig,
	pipeline: VerificationPipeline,
	resolver: Arc<ChallengeResolver>,
	metrics: Option<MetricsCollector>,
}

impl std::fmt::Debug for ImeiVerifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ImeiVerifier")
			.field("portal", &self.config.portal.url.as_str())
			.field("pipeline", &self.pipeline)
			.finish()
	}
}

impl ImeiVerifier {
	/// Build from configuration alone, reading nothing else.
	pub fn new(config: VerifierConfig) -> VerifierResult<Self> {
		ImeiVerifierBuilder::new().with_config(config).build()
	}

	/// Build from process environment variables.
	pub fn from_env() -> VerifierResult<Self> {
		Self::new(VerifierConfig::from_env()?)
	}

	pub fn builder() -> ImeiVerifierBuilder {
		ImeiVerifierBuilder::new()
	}

	fn with_builder(builder: ImeiVerifierBuilder) -> VerifierResult<Self> {
		let ImeiVerifierBuilder {
			config,
			captcha_provider,
			image_provider,
			interactive_provider,
			browser,
			storage,
			handlers,
			enable_metrics,
		} = builder;
		config.validate_bounds()?;

		let resolver = Arc::new(build_resolver(
			&config,
			captcha_provider,
			image_provider,
			interactive_provider,
		)?);

		let storage = match storage {
			Some(storage) => storage,
			None => build_storage(&config.storage)?,
		};

		let browser: Arc<dyn BrowserSession> = match browser {
			Some(browser) => browser,
			None => {
				let mut session = ReqwestBrowserSession::new()
					.with_request_timeout(config.portal.navigation_timeout());
				if let Some(user_agent) = &config.portal.user_agent {
					session = session.with_user_agent(user_agent.clone());
				}
				Arc::new(session)
			}
		};

		let driver = PortalSessionDriver::new(browser, config.portal.url.clone())
			.with_navigation_timeout(config.portal.navigation_timeout())
			.with_result_timeout(config.timeouts.result_render());

		let mut pipeline = VerificationPipeline::new(
			driver,
			Arc::clone(&resolver),
			PersistenceGateway::new(storage),
		)
		.with_retry_policy(config.retry.to_policy())
		.with_resolution_budget(config.timeouts.resolution())
		.with_request_deadline(config.timeouts.request())
		.with_storage_timeout(config.timeouts.storage())
		.with_max_concurrent_sessions(config.concurrency.max_concurrent_sessions)
		.with_overflow_policy(config.concurrency.overflow)
		.with_event_handler(Arc::new(LoggingHandler));

		let metrics = enable_metrics.then(MetricsCollector::new);
		if let Some(metrics) = &metrics {
			pipeline = pipeline.with_event_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		}
		for handler in handlers {
			pipeline = pipeline.with_event_handler(handler);
		}

		log::debug!(
			"verifier ready: portal={} storage={} sessions={}",
			config.portal.url,
			pipeline.gateway().backend_name(),
			config.concurrency.max_concurrent_sessions
		);

		Ok(Self {
			config,
			pipeline,
			resolver,
			metrics,
		})
	}

	/// Verify one raw identifier.
	pub async fn verify(&self, identifier: &str) -> Outcome {
		self.run(VerificationRequest::new(identifier)).await
	}

	/// Run a prepared request.
	pub async fn run(&self, request: VerificationRequest) -> Outcome {
		self.pipeline.run(request).await
	}

	pub fn health(&self) -> Health {
		let captcha_configured = self.resolver.is_configured();
		Health {
			ready: captcha_configured,
			captcha_configured,
			storage_backend: self.pipeline.gateway().backend_name(),
			available_sessions: self.pipeline.available_slots(),
		}
	}

	/// Stored verdicts, newest first, optionally for one identifier.
	pub async fn history(
		&self,
		identifier: Option<&str>,
		limit: usize,
	) -> VerifierResult<Vec<VerificationVerdict>> {
		let identifier = identifier.map(validate).transpose()?;
		Ok(self.pipeline.gateway().history(identifier.as_ref(), limit).await?)
	}

	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	pub fn config(&self) -> &VerifierConfig {
		&self.config
	}
}

fn build_resolver(
	config: &VerifierConfig,
	default: Option<Arc<dyn CaptchaProvider>>,
	image: Option<Arc<dyn CaptchaProvider>>,
	interactive: Option<Arc<dyn CaptchaProvider>>,
) -> VerifierResult<ChallengeResolver> {
	let captcha = &config.captcha;
	let captcha_config = CaptchaConfig {
		timeout: config.timeouts.resolution(),
		poll_interval: captcha.poll_interval(),
	};
	let from_config = |service: CaptchaService| -> Result<Arc<dyn CaptchaProvider>, ConfigError> {
		let key = captcha
			.key_for(service)
			.ok_or(ConfigError::MissingCredential(service.credential_name()))?;
		Ok(match service {
			CaptchaService::TwoCaptcha => {
				Arc::new(TwoCaptchaProvider::with_config(key, captcha_config.clone()))
			}
			CaptchaService::CapMonster => {
				Arc::new(CapMonsterProvider::with_config(key, captcha_config.clone()))
			}
		})
	};

	let default = match default {
		Some(provider) => provider,
		None => from_config(captcha.service)?,
	};
	let mut resolver = ChallengeResolver::new().with_default_provider(default);

	match (image, captcha.image_service) {
		(Some(provider), _) => resolver = resolver.with_image_provider(provider),
		(None, Some(service)) => resolver = resolver.with_image_provider(from_config(service)?),
		(None, None) => {}
	}
	match (interactive, captcha.interactive_service) {
		(Some(provider), _) => resolver = resolver.with_interactive_provider(provider),
		(None, Some(service)) => {
			resolver = resolver.with_interactive_provider(from_config(service)?)
		}
		(None, None) => {}
	}

	Ok(resolver)
}

fn build_storage(settings: &StorageSettings) -> VerifierResult<Arc<dyn StorageBackend>> {
	Ok(match settings {
		StorageSettings::Memory => Arc::new(MemoryStorage::new()),
		StorageSettings::Redb { path } => Arc::new(RedbStorage::open(path)?),
		StorageSettings::Supabase {
			url,
			api_key,
			table,
		} => {
			if api_key.trim().is_empty() {
				return Err(ConfigError::MissingCredential("SUPABASE_ANON_KEY").into());
			}
			Arc::new(SupabaseStorage::new(url.clone(), api_key.clone()).with_table(table.clone()))
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::challenges::core::{Challenge, ChallengeKind, ProofToken};
	use crate::external_deps::captcha::{CaptchaResult, CaptchaSolution};
	use crate::extraction::VerdictStatus;
	use crate::identifier::Identifier;
	use crate::pipeline::FailureKind;
	use crate::portal::{BrowserError, PortalPage, RawResult};
	use async_trait::async_trait;
	use url::Url;

	struct FixedSolver;

	#[async_trait]
	impl CaptchaProvider for FixedSolver {
		fn name(&self) -> &'static str {
			"fixed"
		}

		async fn solve(&self, _challenge: &Challenge) -> CaptchaResult {
			Ok(CaptchaSolution::new("AB12C"))
		}
	}

	struct CompliantPortal;

	struct CompliantPage {
		challenge: Option<Challenge>,
	}

	#[async_trait]
	impl BrowserSession for CompliantPortal {
		async fn open(&self) -> Result<Box<dyn PortalPage>, BrowserError> {
			Ok(Box::new(CompliantPage {
				challenge: Some(Challenge::static_image(vec![0x89, 0x50])),
			}))
		}
	}

	#[async_trait]
	impl PortalPage for CompliantPage {
		async fn navigate(&mut self, _url: &Url) -> Result<(), BrowserError> {
			Ok(())
		}

		async fn detect_challenge(&mut self) -> Result<Option<Challenge>, BrowserError> {
			Ok(self.challenge.take())
		}

		async fn submit_form(
			&mut self,
			_identifier: &Identifier,
			proof: Option<&ProofToken>,
		) -> Result<(), BrowserError> {
			match proof {
				Some(token) if token.value() == "AB12C" => Ok(()),
				_ => Err(BrowserError::ChallengeRejected("wrong code".into())),
			}
		}

		async fn read_result(&mut self) -> Result<RawResult, BrowserError> {
			Ok(RawResult::new("IMEI is valid/compliant").with_image("/images/ok_512.png"))
		}

		async fn close(&mut self) {}
	}

	fn verifier() -> ImeiVerifier {
		ImeiVerifier::builder()
			.with_captcha_provider(Arc::new(FixedSolver))
			.with_browser(Arc::new(CompliantPortal))
			.build()
			.unwrap()
	}

	#[tokio::test]
	async fn verifies_and_records_history() {
		let verifier = verifier();

		let outcome = verifier.verify("35-987197-733119-9").await;
		match &outcome {
			Outcome::Success { verdict, persisted } => {
				assert_eq!(verdict.status, VerdictStatus::Compliant);
				assert!(*persisted);
			}
			other => panic!("unexpected outcome {other:?}"),
		}

		let history = verifier.history(Some("359871977331199"), 10).await.unwrap();
		assert_eq!(history.len(), 1);

		let metrics = verifier.metrics().unwrap();
		assert_eq!(metrics.global.successes, 1);
	}

	#[tokio::test]
	async fn invalid_identifier_fails_without_a_session() {
		let verifier = verifier();
		let outcome = verifier.verify("12345").await;
		assert_eq!(outcome.failure_kind(), Some(FailureKind::InvalidLength));
		assert!(matches!(
			verifier.history(Some("12345"), 10).await,
			Err(VerifierError::Validation(_))
		));
	}

	#[test]
	fn missing_captcha_key_is_a_config_error() {
		let err = ImeiVerifier::builder()
			.with_browser(Arc::new(CompliantPortal))
			.build()
			.unwrap_err();
		assert!(matches!(
			err,
			VerifierError::Config(ConfigError::MissingCredential("CAPTCHA_API_KEY_2CAPTCHA"))
		));
	}

	#[test]
	fn health_reports_backend_and_slots() {
		let verifier = verifier();
		let health = verifier.health();
		assert!(health.ready);
		assert_eq!(health.storage_backend, "memory");
		assert_eq!(health.available_sessions, 4);
	}

	#[test]
	fn config_routes_kinds_to_backends() {
		let mut config = VerifierConfig::builder()
			.with_two_captcha_key("two")
			.with_capmonster_key("cm")
			.build_unchecked();
		config.captcha.interactive_service = Some(CaptchaService::CapMonster);

		let verifier = ImeiVerifier::builder()
			.with_config(config)
			.with_browser(Arc::new(CompliantPortal))
			.build()
			.unwrap();
		let resolver = &verifier.resolver;
		assert_eq!(
			resolver.provider_for(ChallengeKind::StaticImage).map(|p| p.name()),
			Some("2captcha")
		);
		assert_eq!(
			resolver.provider_for(ChallengeKind::Interactive).map(|p| p.name()),
			Some("capmonster")
		);
	}
}
