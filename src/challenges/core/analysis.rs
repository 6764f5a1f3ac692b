//! Portal page parsing helpers.
//!
//! Provides the building blocks needed to inspect the portal's lookup form and
//! turn it into a submission carrying the identifier and the challenge answer.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use thiserror::Error;
use url::Url;

/// Field the portal uses for typed image-captcha answers.
pub const IMAGE_ANSWER_FIELD: &str = "txtCaptcha";
/// Field the reCAPTCHA widget posts its token under.
pub const RECAPTCHA_RESPONSE_FIELD: &str = "g-recaptcha-response";

/// Minimal snapshot of the identifier lookup form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalForm {
    pub action: String,
    pub hidden_fields: Vec<(String, String)>,
    pub identifier_field: String,
    pub image_answer_field: Option<String>,
}

/// Form payload ready to be posted back to the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSubmission {
    pub url: Url,
    pub fields: Vec<(String, String)>,
}

impl FormSubmission {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Which answer slot a proof token is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerSlot {
    ImageText,
    InteractiveToken,
}

impl PortalForm {
    pub fn to_submission(
        self,
        base_url: &Url,
        identifier: &str,
        answer: Option<(AnswerSlot, &str)>,
    ) -> Result<FormSubmission, PortalParseError> {
        let mut fields = self.hidden_fields;
        fields.push((self.identifier_field, identifier.to_string()));

        match answer {
            Some((AnswerSlot::ImageText, token)) => {
                let name = self
                    .image_answer_field
                    .ok_or(PortalParseError::MissingField(IMAGE_ANSWER_FIELD))?;
                fields.push((name, token.to_string()));
            }
            Some((AnswerSlot::InteractiveToken, token)) => {
                fields.retain(|(name, _)| name != RECAPTCHA_RESPONSE_FIELD);
                fields.push((RECAPTCHA_RESPONSE_FIELD.to_string(), token.to_string()));
            }
            None => {}
        }

        let url = if self.action.trim().is_empty() {
            base_url.clone()
        } else {
            let action = html_escape::decode_html_entities(&self.action).into_owned();
            base_url
                .join(&action)
                .map_err(PortalParseError::InvalidAction)?
        };

        Ok(FormSubmission { url, fields })
    }
}

/// Outcomes when parsing the portal page fails.
#[derive(Debug, Error)]
pub enum PortalParseError {
    #[error("unable to locate identifier lookup form")]
    FormNotFound,
    #[error("missing required form field: {0}")]
    MissingField(&'static str),
    #[error("invalid form action: {0}")]
    InvalidAction(url::ParseError),
}

/// Extract the lookup form (action, hidden fields, input names) from the page body.
pub fn parse_portal_form(body: &str) -> Result<PortalForm, PortalParseError> {
    for caps in FORM_RE.captures_iter(body) {
        let open_tag = caps.name("open").map(|m| m.as_str()).unwrap_or("");
        let inner = caps.name("inputs").map(|m| m.as_str()).unwrap_or("");

        let inputs = collect_inputs(inner);
        let Some(identifier_input) = inputs.iter().find(|input| input.is_identifier()) else {
            continue;
        };

        let identifier_field = identifier_input
            .name
            .clone()
            .unwrap_or_else(|| "imei".to_string());

        let image_answer_field = inputs
            .iter()
            .find(|input| input.matches(IMAGE_ANSWER_FIELD))
            .map(|input| {
                input
                    .name
                    .clone()
                    .unwrap_or_else(|| IMAGE_ANSWER_FIELD.to_string())
            });

        let hidden_fields = inputs
            .iter()
            .filter(|input| input.kind.eq_ignore_ascii_case("hidden"))
            .filter_map(|input| {
                input
                    .name
                    .clone()
                    .map(|name| (name, input.value.clone().unwrap_or_default()))
            })
            .collect();

        let action = attributes(open_tag)
            .into_iter()
            .find(|(name, _)| name == "action")
            .map(|(_, value)| value)
            .unwrap_or_default();

        return Ok(PortalForm {
            action,
            hidden_fields,
            identifier_field,
            image_answer_field,
        });
    }

    Err(PortalParseError::FormNotFound)
}

/// Build origin header value from URL (`scheme://host[:port]`).
pub fn origin_from_url(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

#[derive(Debug, Default)]
struct InputTag {
    id: Option<String>,
    name: Option<String>,
    value: Option<String>,
    kind: String,
}

impl InputTag {
    fn matches(&self, key: &str) -> bool {
        self.id.as_deref() == Some(key) || self.name.as_deref() == Some(key)
    }

    fn is_identifier(&self) -> bool {
        self.id
            .as_deref()
            .or(self.name.as_deref())
            .is_some_and(|key| key.eq_ignore_ascii_case("imei"))
    }
}

fn collect_inputs(fragment: &str) -> Vec<InputTag> {
    INPUT_RE
        .captures_iter(fragment)
        .map(|caps| {
            let mut tag = InputTag {
                kind: "text".into(),
                ..InputTag::default()
            };
            for (name, value) in attributes(caps.get(1).map(|m| m.as_str()).unwrap_or("")) {
                match name.as_str() {
                    "id" => tag.id = Some(value),
                    "name" => tag.name = Some(value),
                    "value" => tag.value = Some(html_escape::decode_html_entities(&value).into_owned()),
                    "type" => tag.kind = value,
                    _ => {}
                }
            }
            tag
        })
        .collect()
}

fn attributes(fragment: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(fragment)
        .filter_map(|caps| {
            let name = caps.name("name")?.as_str().to_ascii_lowercase();
            let value = caps.name("value")?.as_str().to_string();
            Some((name, value))
        })
        .collect()
}

static FORM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?P<open><form[^>]*>)(?P<inputs>.*?)</form>"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid form regex")
});

static INPUT_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"<input\s+([^>]+?)/?>"#)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid input regex")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(?P<name>[^\s=]+)\s*=\s*['"](?P<value>[^'"]*)['"]"#)
        .case_insensitive(true)
        .build()
        .expect("invalid attribute regex")
});
