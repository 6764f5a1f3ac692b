//! Reqwest-based implementation of the `BrowserSession` capability.
//!
//! Each session is a fresh cookie-keeping client so no state leaks between
//! attempts. Pages are parsed with `scraper`; parsing happens in synchronous
//! helpers so no document is held across an await point.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::Utc;
use http::header::{CONTENT_TYPE, ORIGIN, REFERER};
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use url::Url;

use super::{BrowserError, BrowserSession, PortalPage, RawResult, is_blocked_page, snippet};
use crate::challenges::core::{
    AnswerSlot, Challenge, ChallengeKind, PortalParseError, ProofToken, origin_from_url,
    parse_portal_form,
};
use crate::challenges::detectors::ChallengeDetector;
use crate::identifier::Identifier;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Opens cookie-isolated HTTP sessions against the portal.
#[derive(Debug, Clone)]
pub struct ReqwestBrowserSession {
    user_agent: String,
    request_timeout: Duration,
}

impl Default for ReqwestBrowserSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestBrowserSession {
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl BrowserSession for ReqwestBrowserSession {
    async fn open(&self) -> Result<Box<dyn PortalPage>, BrowserError> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(&self.user_agent)
            .timeout(self.request_timeout)
            .build()
            .map_err(|err| BrowserError::Transport(err.to_string()))?;
        Ok(Box::new(ReqwestPortalPage::new(client)))
    }
}

/// A single page loaded through reqwest.
#[derive(Debug)]
pub struct ReqwestPortalPage {
    client: Option<Client>,
    current: Option<LoadedPage>,
    challenge: Option<ChallengeKind>,
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: Url,
    body: String,
}

impl ReqwestPortalPage {
    pub fn new(client: Client) -> Self {
        Self {
            client: Some(client),
            current: None,
            challenge: None,
        }
    }

    fn client(&self) -> Result<&Client, BrowserError> {
        self.client
            .as_ref()
            .ok_or_else(|| BrowserError::Navigation("page already closed".into()))
    }

    fn loaded(&self) -> Result<&LoadedPage, BrowserError> {
        self.current
            .as_ref()
            .ok_or_else(|| BrowserError::ElementMissing("no page loaded".into()))
    }

    async fn fetch_image(&self, src: &str, base: &Url) -> Result<(Bytes, String), BrowserError> {
        if let Some(inline) = decode_data_uri(src) {
            return inline;
        }

        let url = base
            .join(src)
            .map_err(|err| BrowserError::ElementMissing(format!("captcha image src: {err}")))?;
        let response = self
            .client()?
            .get(url)
            .header(REFERER, base.as_str())
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response.status(), "")?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let image = response.bytes().await.map_err(transport_error)?;
        Ok((image, content_type))
    }
}

#[async_trait]
impl PortalPage for ReqwestPortalPage {
    async fn navigate(&mut self, url: &Url) -> Result<(), BrowserError> {
        let response = self
            .client()?
            .get(url.clone())
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let final_url = response.url().clone();
        let body = response.text().await.map_err(transport_error)?;
        check_status(status, &body)?;
        if is_blocked_page(&visible_text(&body)) {
            return Err(BrowserError::Blocked(snippet(&visible_text(&body))));
        }

        log::debug!("loaded portal page {final_url} ({} bytes)", body.len());
        self.current = Some(LoadedPage {
            url: final_url,
            body,
        });
        self.challenge = None;
        Ok(())
    }

    async fn detect_challenge(&mut self) -> Result<Option<Challenge>, BrowserError> {
        let page = self.loaded()?.clone();
        let detector = ChallengeDetector::new();

        let Some(detection) = detector.detect(&page.body) else {
            if !detector.has_identifier_input(&page.body) {
                return Err(BrowserError::ElementMissing("input#imei".into()));
            }
            return Ok(None);
        };
        log::debug!(
            "detected {} challenge ({}, confidence {:.2})",
            detection.kind,
            detection.pattern_id,
            detection.confidence
        );

        let challenge = match detection.kind {
            ChallengeKind::StaticImage => {
                let src = detection
                    .image_src
                    .ok_or_else(|| BrowserError::ElementMissing("img#captchaimg src".into()))?;
                let (image, content_type) = self.fetch_image(&src, &page.url).await?;
                Challenge::StaticImage {
                    image,
                    content_type,
                }
            }
            ChallengeKind::Interactive => {
                let site_key = detection
                    .site_key
                    .ok_or_else(|| BrowserError::ElementMissing("data-sitekey".into()))?;
                Challenge::interactive(site_key, page.url.clone())
            }
        };

        self.challenge = Some(detection.kind);
        Ok(Some(challenge))
    }

    async fn submit_form(
        &mut self,
        identifier: &Identifier,
        proof: Option<&ProofToken>,
    ) -> Result<(), BrowserError> {
        let page = self.loaded()?;
        let answer = match (self.challenge, proof) {
            (Some(ChallengeKind::StaticImage), Some(token)) => {
                Some((AnswerSlot::ImageText, token.value()))
            }
            (Some(ChallengeKind::Interactive), Some(token)) => {
                Some((AnswerSlot::InteractiveToken, token.value()))
            }
            (Some(kind), None) => {
                return Err(BrowserError::ChallengeRejected(format!(
                    "{kind} challenge present but no answer supplied"
                )));
            }
            (None, _) => None,
        };

        let submission = parse_portal_form(&page.body)
            .and_then(|form| form.to_submission(&page.url, identifier.as_str(), answer))
            .map_err(|err| match err {
                PortalParseError::FormNotFound => BrowserError::ElementMissing("lookup form".into()),
                other => BrowserError::ElementMissing(other.to_string()),
            })?;

        let origin = origin_from_url(&page.url);
        let referer = page.url.to_string();
        let response = self
            .client()?
            .post(submission.url.clone())
            .header(ORIGIN, origin)
            .header(REFERER, referer)
            .form(&submission.fields)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let url = response.url().clone();
        let body = response.text().await.map_err(transport_error)?;
        check_status(status, &body)?;

        log::debug!("submitted lookup form for {identifier} to {}", submission.url);
        self.current = Some(LoadedPage { url, body });
        Ok(())
    }

    async fn read_result(&mut self) -> Result<RawResult, BrowserError> {
        let page = self.loaded()?;
        let banner = parse_result_banner(&page.body);

        let raw = match banner {
            Some((text, image_src)) => {
                let mut raw = RawResult::new(text);
                raw.image_src = image_src;
                raw
            }
            None => {
                let text = visible_text(&page.body);
                if text.is_empty() {
                    return Err(BrowserError::ElementMissing("article.dirbs-banner".into()));
                }
                log::debug!("result banner missing; falling back to page text");
                RawResult::new(text.chars().take(500).collect::<String>())
            }
        };

        Ok(raw.with_page_url(page.url.clone()).captured_at(Utc::now()))
    }

    async fn close(&mut self) {
        self.current = None;
        self.challenge = None;
        self.client = None;
    }
}

fn transport_error(err: reqwest::Error) -> BrowserError {
    if err.is_timeout() {
        BrowserError::Timeout
    } else if err.is_connect() || err.is_request() {
        BrowserError::Navigation(err.to_string())
    } else {
        BrowserError::Transport(err.to_string())
    }
}

/// 429 is always a ban; 403 only when the page says so.
fn check_status(status: StatusCode, body: &str) -> Result<(), BrowserError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BrowserError::Blocked(format!("HTTP {}", status.as_u16())));
    }
    if status.is_server_error() || status.is_client_error() {
        let text = visible_text(body);
        if status == StatusCode::FORBIDDEN && is_blocked_page(&text) {
            return Err(BrowserError::Blocked(format!("HTTP 403: {}", snippet(&text))));
        }
        return Err(BrowserError::ServerError {
            status: status.as_u16(),
            message: snippet(&text),
        });
    }
    Ok(())
}

/// Decode `data:<mime>;base64,<payload>` image sources.
fn decode_data_uri(src: &str) -> Option<Result<(Bytes, String), BrowserError>> {
    let rest = src.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let content_type = meta
        .strip_suffix(";base64")
        .filter(|mime| !mime.is_empty())
        .unwrap_or("image/png")
        .to_string();
    Some(
        BASE64
            .decode(payload.trim())
            .map(|image| (Bytes::from(image), content_type))
            .map_err(|err| BrowserError::ElementMissing(format!("captcha data uri: {err}"))),
    )
}

fn selector(raw: &str) -> Selector {
    Selector::parse(raw).expect("invalid result selector")
}

static BANNER_TEXT: Lazy<Selector> = Lazy::new(|| selector("article.dirbs-banner p.text"));
static BANNER_IMAGE: Lazy<Selector> = Lazy::new(|| selector("article.dirbs-banner img"));
static BODY: Lazy<Selector> = Lazy::new(|| selector("body"));

/// Banner text and status image, if the result banner rendered.
fn parse_result_banner(body: &str) -> Option<(String, Option<String>)> {
    let document = Html::parse_document(body);
    let text = document
        .select(&BANNER_TEXT)
        .map(|node| collapse(node.text()))
        .find(|text| !text.is_empty())?;
    let image_src = document
        .select(&BANNER_IMAGE)
        .find_map(|node| node.value().attr("src").map(str::to_string));
    Some((text, image_src))
}

/// Whitespace-collapsed text of the document body.
fn visible_text(body: &str) -> String {
    let document = Html::parse_document(body);
    document
        .select(&BODY)
        .next()
        .map(|node| collapse(node.text()))
        .unwrap_or_default()
}

fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
