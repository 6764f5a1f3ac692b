//! Portal session driver.
//!
//! Drives one browser session per attempt through the lookup flow:
//! navigate, answer any challenge, submit the identifier, and wait for the
//! verdict banner to render. The session is always closed, including when
//! the attempt future is dropped.

pub mod http_session;

pub use http_session::{ReqwestBrowserSession, ReqwestPortalPage};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use url::Url;

use crate::challenges::core::{Challenge, ChallengeKind, ProofToken};
use crate::challenges::{ProofProvider, ResolutionError};
use crate::identifier::Identifier;
use crate::pipeline::{FailureKind, Stage};

/// What the session read off the rendered result page.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub text: String,
    /// Source of the status image shown next to the verdict, if any.
    pub image_src: Option<String>,
    pub page_url: Option<Url>,
    pub captured_at: DateTime<Utc>,
}

impl RawResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_src: None,
            page_url: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_image(mut self, src: impl Into<String>) -> Self {
        self.image_src = Some(src.into());
        self
    }

    pub fn with_page_url(mut self, url: Url) -> Self {
        self.page_url = Some(url);
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = at;
        self
    }
}

/// Low-level failures reported by a browser implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("browser operation timed out")]
    Timeout,
    #[error("portal returned HTTP {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("portal refused service: {0}")]
    Blocked(String),
    #[error("portal rejected the challenge answer: {0}")]
    ChallengeRejected(String),
    #[error("expected element missing: {0}")]
    ElementMissing(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Capability to open a fresh, isolated browser session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PortalPage>, BrowserError>;
}

/// One open page on the portal.
#[async_trait]
pub trait PortalPage: Send {
    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError>;

    /// Challenge currently rendered in front of the form, if any.
    async fn detect_challenge(&mut self) -> Result<Option<Challenge>, BrowserError>;

    async fn submit_form(
        &mut self,
        identifier: &Identifier,
        proof: Option<&ProofToken>,
    ) -> Result<(), BrowserError>;

    async fn read_result(&mut self) -> Result<RawResult, BrowserError>;

    /// Release the session. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Session failures as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("portal rejected the challenge answer: {0}")]
    ChallengeRejected(String),
    #[error("result did not render within {0:?}")]
    Timeout(Duration),
    #[error("portal error: {0}")]
    PortalError(String),
    #[error("portal unreachable: {0}")]
    Navigation(String),
    #[error("proof token expired before submission")]
    TokenExpired,
    #[error("portal blocked the session: {0}")]
    Blocked(String),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Blocked(_) => false,
            SessionError::Resolution(err) => err.is_retryable(),
            _ => true,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::ChallengeRejected(_) => FailureKind::ChallengeRejected,
            SessionError::Timeout(_) => FailureKind::SessionTimeout,
            SessionError::PortalError(_) => FailureKind::PortalError,
            SessionError::Navigation(_) => FailureKind::Navigation,
            SessionError::TokenExpired => FailureKind::TokenExpired,
            SessionError::Blocked(_) => FailureKind::Blocked,
            SessionError::Resolution(err) => err.failure_kind(),
        }
    }

    /// Pipeline stage the failure is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            SessionError::Resolution(_) => Stage::ChallengeResolution,
            _ => Stage::PortalSession,
        }
    }
}

/// Per-attempt session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Navigating,
    ChallengePresented(ChallengeKind),
    FormReady,
    Submitted,
    ResultRendered,
    Failed(FailureKind),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Navigating => f.write_str("navigating"),
            SessionState::ChallengePresented(kind) => write!(f, "challenge_presented({kind})"),
            SessionState::FormReady => f.write_str("form_ready"),
            SessionState::Submitted => f.write_str("submitted"),
            SessionState::ResultRendered => f.write_str("result_rendered"),
            SessionState::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

/// Ordered record of the states one attempt went through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTrace {
    states: Vec<SessionState>,
}

impl SessionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, state: SessionState) {
        log::debug!("portal session -> {state}");
        self.states.push(state);
    }

    pub fn states(&self) -> &[SessionState] {
        &self.states
    }

    pub fn current(&self) -> Option<SessionState> {
        self.states.last().copied()
    }
}

/// Closes the page on every exit path; on drop the close runs on a spawned task.
struct PageGuard {
    page: Option<Box<dyn PortalPage>>,
}

impl PageGuard {
    fn new(page: Box<dyn PortalPage>) -> Self {
        Self { page: Some(page) }
    }

    fn page(&mut self) -> Option<&mut (dyn PortalPage + 'static)> {
        self.page.as_deref_mut()
    }

    async fn close(mut self) {
        if let Some(mut page) = self.page.take() {
            page.close().await;
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let Some(mut page) = self.page.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::debug!("attempt dropped mid-session; closing page in background");
                handle.spawn(async move { page.close().await });
            }
            Err(_) => log::warn!("no runtime available to close abandoned portal page"),
        }
    }
}

/// Drives one portal session per call.
#[derive(Clone)]
pub struct PortalSessionDriver {
    browser: Arc<dyn BrowserSession>,
    portal_url: Url,
    navigation_timeout: Duration,
    result_timeout: Duration,
}

impl fmt::Debug for PortalSessionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalSessionDriver")
            .field("portal_url", &self.portal_url.as_str())
            .field("navigation_timeout", &self.navigation_timeout)
            .field("result_timeout", &self.result_timeout)
            .finish()
    }
}

impl PortalSessionDriver {
    pub fn new(browser: Arc<dyn BrowserSession>, portal_url: Url) -> Self {
        Self {
            browser,
            portal_url,
            navigation_timeout: Duration::from_secs(30),
            result_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn portal_url(&self) -> &Url {
        &self.portal_url
    }

    /// Run one attempt and return what the result page showed.
    pub async fn submit(
        &self,
        identifier: &Identifier,
        proof: &dyn ProofProvider,
    ) -> Result<RawResult, SessionError> {
        let mut trace = SessionTrace::new();
        self.submit_with_trace(identifier, proof, &mut trace).await
    }

    pub async fn submit_with_trace(
        &self,
        identifier: &Identifier,
        proof: &dyn ProofProvider,
        trace: &mut SessionTrace,
    ) -> Result<RawResult, SessionError> {
        trace.enter(SessionState::Navigating);

        let opened = tokio::time::timeout(self.navigation_timeout, self.browser.open()).await;
        let page = match opened {
            Err(_) => Err(SessionError::Navigation(format!(
                "browser did not open within {:?}",
                self.navigation_timeout
            ))),
            Ok(result) => result.map_err(navigation_error),
        };
        let mut guard = match page {
            Ok(page) => PageGuard::new(page),
            Err(err) => {
                trace.enter(SessionState::Failed(err.failure_kind()));
                return Err(err);
            }
        };

        let result = match guard.page() {
            Some(page) => self.drive(page, identifier, proof, trace).await,
            None => Err(SessionError::PortalError("page already closed".into())),
        };
        guard.close().await;

        if let Err(err) = &result {
            trace.enter(SessionState::Failed(err.failure_kind()));
        }
        result
    }

    async fn drive(
        &self,
        page: &mut dyn PortalPage,
        identifier: &Identifier,
        proof: &dyn ProofProvider,
        trace: &mut SessionTrace,
    ) -> Result<RawResult, SessionError> {
        match tokio::time::timeout(self.navigation_timeout, page.navigate(&self.portal_url)).await {
            Err(_) => {
                return Err(SessionError::Navigation(format!(
                    "portal did not load within {:?}",
                    self.navigation_timeout
                )));
            }
            Ok(result) => result.map_err(navigation_error)?,
        }

        let detected = tokio::time::timeout(self.navigation_timeout, page.detect_challenge()).await;
        let challenge = match detected {
            Err(_) => {
                return Err(SessionError::Navigation(format!(
                    "portal form did not load within {:?}",
                    self.navigation_timeout
                )));
            }
            Ok(result) => result.map_err(navigation_error)?,
        };
        let token = match challenge {
            Some(challenge) => {
                trace.enter(SessionState::ChallengePresented(challenge.kind()));
                Some(proof.provide(challenge).await?)
            }
            None => None,
        };
        trace.enter(SessionState::FormReady);

        if token.as_ref().is_some_and(ProofToken::is_expired) {
            log::warn!("proof token expired before submission for {identifier}");
            return Err(SessionError::TokenExpired);
        }

        let submitted =
            tokio::time::timeout(self.result_timeout, page.submit_form(identifier, token.as_ref()))
                .await;
        match submitted {
            Err(_) => return Err(SessionError::Timeout(self.result_timeout)),
            Ok(result) => result.map_err(|err| self.response_error(err))?,
        }
        drop(token);
        trace.enter(SessionState::Submitted);

        let raw = match tokio::time::timeout(self.result_timeout, page.read_result()).await {
            Err(_) => return Err(SessionError::Timeout(self.result_timeout)),
            Ok(result) => result.map_err(|err| self.response_error(err))?,
        };

        classify_result_page(&raw)?;
        trace.enter(SessionState::ResultRendered);
        Ok(raw)
    }

    /// Browser errors after the form is filled; a browser-side timeout counts
    /// against the result budget.
    fn response_error(&self, err: BrowserError) -> SessionError {
        match err {
            BrowserError::Timeout => SessionError::Timeout(self.result_timeout),
            other => session_error(other),
        }
    }
}

fn navigation_error(err: BrowserError) -> SessionError {
    match err {
        BrowserError::Navigation(msg) | BrowserError::Transport(msg) => SessionError::Navigation(msg),
        BrowserError::Timeout => SessionError::Navigation("navigation timed out".into()),
        other => session_error(other),
    }
}

fn session_error(err: BrowserError) -> SessionError {
    match err {
        BrowserError::Blocked(msg) => SessionError::Blocked(msg),
        BrowserError::ChallengeRejected(msg) => SessionError::ChallengeRejected(msg),
        BrowserError::ServerError { status, message } => {
            SessionError::PortalError(format!("HTTP {status}: {message}"))
        }
        BrowserError::Navigation(msg) | BrowserError::Transport(msg) => SessionError::Navigation(msg),
        BrowserError::ElementMissing(what) => {
            SessionError::PortalError(format!("missing element: {what}"))
        }
        BrowserError::Timeout => SessionError::PortalError("browser operation timed out".into()),
    }
}

/// Reject result pages that are really ban notices or captcha errors.
fn classify_result_page(raw: &RawResult) -> Result<(), SessionError> {
    if is_blocked_page(&raw.text) {
        return Err(SessionError::Blocked(snippet(&raw.text)));
    }
    if is_challenge_rejection(&raw.text) {
        return Err(SessionError::ChallengeRejected(snippet(&raw.text)));
    }
    Ok(())
}

/// Ban and rate-limit notices. Device-level "blocked" verdicts do not match.
pub(crate) fn is_blocked_page(text: &str) -> bool {
    BLOCKED_PAGE_RE.is_match(text)
}

pub(crate) fn is_challenge_rejection(text: &str) -> bool {
    CHALLENGE_REJECTED_RE.is_match(text)
}

pub(crate) fn snippet(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(160).collect()
}

static BLOCKED_PAGE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"too many requests|rate limit(?:ed)?\b|access denied|request (?:has been )?rejected|you have been (?:temporarily )?(?:blocked|banned)|your ip (?:address )?(?:has been|is) (?:blocked|banned)",
    )
    .case_insensitive(true)
    .build()
    .expect("invalid blocked page regex")
});

static CHALLENGE_REJECTED_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"(?:invalid|incorrect|wrong) (?:captcha|security code|verification code)|captcha (?:is )?(?:invalid|incorrect|expired|required)|please (?:complete|verify) (?:the )?(?:captcha|recaptcha)",
    )
    .case_insensitive(true)
    .build()
    .expect("invalid captcha rejection regex")
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        submitted_tokens: Mutex<Vec<Option<String>>>,
    }

    #[derive(Clone)]
    enum ResultMode {
        Text(&'static str),
        Hang,
        Error(BrowserError),
    }

    #[derive(Clone)]
    enum SubmitMode {
        Accept,
        Hang,
        Error(BrowserError),
    }

    struct StubBrowser {
        counters: Arc<Counters>,
        challenge: Option<Challenge>,
        detect_hangs: bool,
        submit: SubmitMode,
        result: ResultMode,
    }

    struct StubPage {
        counters: Arc<Counters>,
        challenge: Option<Challenge>,
        detect_hangs: bool,
        submit: SubmitMode,
        result: ResultMode,
    }

    #[async_trait]
    impl BrowserSession for StubBrowser {
        async fn open(&self) -> Result<Box<dyn PortalPage>, BrowserError> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubPage {
                counters: Arc::clone(&self.counters),
                challenge: self.challenge.clone(),
                detect_hangs: self.detect_hangs,
                submit: self.submit.clone(),
                result: self.result.clone(),
            }))
        }
    }

    #[async_trait]
    impl PortalPage for StubPage {
        async fn navigate(&mut self, _url: &Url) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn detect_challenge(&mut self) -> Result<Option<Challenge>, BrowserError> {
            if self.detect_hangs {
                std::future::pending::<()>().await;
            }
            Ok(self.challenge.take())
        }

        async fn submit_form(
            &mut self,
            _identifier: &Identifier,
            proof: Option<&ProofToken>,
        ) -> Result<(), BrowserError> {
            self.counters
                .submitted_tokens
                .lock()
                .unwrap()
                .push(proof.map(|token| token.value().to_string()));
            match &self.submit {
                SubmitMode::Accept => Ok(()),
                SubmitMode::Hang => std::future::pending().await,
                SubmitMode::Error(err) => Err(err.clone()),
            }
        }

        async fn read_result(&mut self) -> Result<RawResult, BrowserError> {
            match &self.result {
                ResultMode::Text(text) => Ok(RawResult::new(*text)),
                ResultMode::Hang => std::future::pending().await,
                ResultMode::Error(err) => Err(err.clone()),
            }
        }

        async fn close(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedProof {
        ttl: Duration,
        fail: Option<ResolutionError>,
    }

    #[async_trait]
    impl ProofProvider for FixedProof {
        async fn provide(&self, _challenge: Challenge) -> Result<ProofToken, ResolutionError> {
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(ProofToken::new("solved", self.ttl)),
            }
        }
    }

    fn proof() -> FixedProof {
        FixedProof {
            ttl: Duration::from_secs(60),
            fail: None,
        }
    }

    fn driver(browser: StubBrowser) -> PortalSessionDriver {
        PortalSessionDriver::new(
            Arc::new(browser),
            Url::parse("https://dirbs.example.gov/").unwrap(),
        )
    }

    fn identifier() -> Identifier {
        Identifier::parse("359871977331199").unwrap()
    }

    fn browser(challenge: Option<Challenge>, result: ResultMode) -> (StubBrowser, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            StubBrowser {
                counters: Arc::clone(&counters),
                challenge,
                detect_hangs: false,
                submit: SubmitMode::Accept,
                result,
            },
            counters,
        )
    }

    #[tokio::test]
    async fn challenge_path_walks_every_state() {
        let (stub, counters) = browser(
            Some(Challenge::static_image(vec![1, 2, 3])),
            ResultMode::Text("The IMEI is valid/compliant"),
        );
        let mut trace = SessionTrace::new();
        let raw = driver(stub)
            .submit_with_trace(&identifier(), &proof(), &mut trace)
            .await
            .unwrap();

        assert_eq!(raw.text, "The IMEI is valid/compliant");
        assert_eq!(
            trace.states(),
            &[
                SessionState::Navigating,
                SessionState::ChallengePresented(ChallengeKind::StaticImage),
                SessionState::FormReady,
                SessionState::Submitted,
                SessionState::ResultRendered,
            ]
        );
        assert_eq!(
            counters.submitted_tokens.lock().unwrap().as_slice(),
            &[Some("solved".to_string())]
        );
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_result_times_out_and_closes() {
        let (stub, counters) = browser(None, ResultMode::Hang);
        let mut trace = SessionTrace::new();
        let err = driver(stub)
            .with_result_timeout(Duration::from_secs(3))
            .submit_with_trace(&identifier(), &proof(), &mut trace)
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::Timeout(Duration::from_secs(3)));
        assert!(err.is_retryable());
        assert_eq!(
            trace.current(),
            Some(SessionState::Failed(FailureKind::SessionTimeout))
        );
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_submit_is_a_session_timeout() {
        let (mut stub, counters) = browser(None, ResultMode::Text("valid/compliant"));
        stub.submit = SubmitMode::Hang;
        let mut trace = SessionTrace::new();
        let err = driver(stub)
            .with_result_timeout(Duration::from_secs(3))
            .submit_with_trace(&identifier(), &proof(), &mut trace)
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::Timeout(Duration::from_secs(3)));
        assert_eq!(err.failure_kind(), FailureKind::SessionTimeout);
        assert_eq!(
            trace.current(),
            Some(SessionState::Failed(FailureKind::SessionTimeout))
        );
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn browser_timeout_on_submit_is_a_session_timeout() {
        let (mut stub, _) = browser(None, ResultMode::Text("valid/compliant"));
        stub.submit = SubmitMode::Error(BrowserError::Timeout);
        let err = driver(stub)
            .with_result_timeout(Duration::from_secs(3))
            .submit(&identifier(), &proof())
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::Timeout(Duration::from_secs(3)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_challenge_detection_is_a_navigation_failure() {
        let (mut stub, counters) = browser(None, ResultMode::Text("valid/compliant"));
        stub.detect_hangs = true;
        let err = driver(stub).submit(&identifier(), &proof()).await.unwrap_err();

        assert_eq!(err.failure_kind(), FailureKind::Navigation);
        assert!(counters.submitted_tokens.lock().unwrap().is_empty());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_is_not_submitted() {
        let (stub, counters) = browser(
            Some(Challenge::static_image(vec![1])),
            ResultMode::Text("valid/compliant"),
        );
        let expired = FixedProof {
            ttl: Duration::ZERO,
            fail: None,
        };
        let err = driver(stub).submit(&identifier(), &expired).await.unwrap_err();
        assert_eq!(err, SessionError::TokenExpired);
        assert!(counters.submitted_tokens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ban_page_is_terminal() {
        let (stub, _) = browser(
            None,
            ResultMode::Text("Too many requests from your network. Try later."),
        );
        let err = driver(stub).submit(&identifier(), &proof()).await.unwrap_err();
        assert!(matches!(err, SessionError::Blocked(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.failure_kind(), FailureKind::Blocked);
    }

    #[tokio::test]
    async fn device_blocked_verdict_is_not_a_ban() {
        let (stub, _) = browser(None, ResultMode::Text("This IMEI is blocked on the network"));
        assert!(driver(stub).submit(&identifier(), &proof()).await.is_ok());
    }

    #[tokio::test]
    async fn captcha_error_and_server_error_are_retryable() {
        let (stub, _) = browser(None, ResultMode::Text("Invalid captcha, please try again"));
        let err = driver(stub).submit(&identifier(), &proof()).await.unwrap_err();
        assert!(matches!(err, SessionError::ChallengeRejected(_)));
        assert!(err.is_retryable());

        let (stub, _) = browser(
            None,
            ResultMode::Error(BrowserError::ServerError {
                status: 502,
                message: "bad gateway".into(),
            }),
        );
        let err = driver(stub).submit(&identifier(), &proof()).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::PortalError);
    }

    #[tokio::test]
    async fn resolution_failure_is_attributed_to_resolution_stage() {
        let (stub, counters) = browser(
            Some(Challenge::static_image(vec![1])),
            ResultMode::Text("valid/compliant"),
        );
        let failing = FixedProof {
            ttl: Duration::from_secs(60),
            fail: Some(ResolutionError::NoProvider(ChallengeKind::StaticImage)),
        };
        let err = driver(stub).submit(&identifier(), &failing).await.unwrap_err();
        assert_eq!(err.stage(), Stage::ChallengeResolution);
        assert!(!err.is_retryable());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_attempt_still_closes_page() {
        let (stub, counters) = browser(None, ResultMode::Hang);
        let driver = driver(stub);
        let task = tokio::spawn(async move { driver.submit(&identifier(), &proof()).await });

        while counters.opened.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for _ in 0..10 {
            if counters.closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }
}
