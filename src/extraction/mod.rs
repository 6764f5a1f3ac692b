//! Result extraction.
//!
//! Turns what the session read off the result page into a normalized
//! verdict. Rules are ordered: status-image markers first, then text rules.
//! Output that matches no rule is reported, never defaulted.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::Identifier;
use crate::pipeline::FailureKind;
use crate::portal::RawResult;

/// Normalized compliance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictStatus {
    Compliant,
    #[serde(rename = "Non-Compliant")]
    NonCompliant,
    Blocked,
    Unknown,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Compliant => "Compliant",
            VerdictStatus::NonCompliant => "Non-Compliant",
            VerdictStatus::Blocked => "Blocked",
            VerdictStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit persisted for every successful lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub identifier: Identifier,
    pub status: VerdictStatus,
    pub raw_message: String,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("unrecognized result format: {0:?}")]
    UnrecognizedFormat(String),
}

impl ExtractionError {
    pub fn is_retryable(&self) -> bool {
        false
    }

    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::UnrecognizedFormat
    }
}

/// Where a rule looks for its marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleTarget {
    StatusImage,
    Text,
}

#[derive(Debug)]
struct ExtractionRule {
    id: &'static str,
    target: RuleTarget,
    pattern: Regex,
    status: VerdictStatus,
}

impl ExtractionRule {
    fn new(id: &'static str, target: RuleTarget, pattern: &str, status: VerdictStatus) -> Self {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("invalid extraction rule");
        Self {
            id,
            target,
            pattern,
            status,
        }
    }

    fn matches(&self, raw: &RawResult, text: &str) -> bool {
        match self.target {
            RuleTarget::StatusImage => raw
                .image_src
                .as_deref()
                .is_some_and(|src| self.pattern.is_match(src)),
            RuleTarget::Text => self.pattern.is_match(text),
        }
    }
}

static RULES: Lazy<Vec<ExtractionRule>> = Lazy::new(|| {
    use RuleTarget::*;
    use VerdictStatus::*;
    vec![
        ExtractionRule::new("image_ok", StatusImage, r"ok_512\.png", Compliant),
        ExtractionRule::new("image_blocked", StatusImage, r"blocked_512\.png", NonCompliant),
        ExtractionRule::new(
            "text_non_compliant",
            Text,
            r"\bnon[\s-]?compliant\b|\bnot[\s-]compliant\b|not been paid|taxes? (?:is|are) (?:unpaid|due)",
            NonCompliant,
        ),
        ExtractionRule::new(
            "text_blocked",
            Text,
            r"\b(?:is|has been) (?:blocked|blacklisted)\b|\bblocked (?:imei|device)\b|reported (?:as )?(?:stolen|lost)",
            Blocked,
        ),
        ExtractionRule::new(
            "text_compliant",
            Text,
            r"valid/compliant|\bcompliant\b",
            Compliant,
        ),
        ExtractionRule::new(
            "text_unknown",
            Text,
            r"\bnot found\b|no record|does not exist|could not be (?:verified|determined)|\binvalid imei\b",
            Unknown,
        ),
    ]
});

static QUOTED_MODEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("invalid quoted model regex"));

static DEVICE_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"This IMEI is of (.*?) device")
        .case_insensitive(true)
        .build()
        .expect("invalid device phrase regex")
});

/// Pure, deterministic verdict extraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResultExtractor;

impl ResultExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(
        &self,
        raw: &RawResult,
        identifier: &Identifier,
    ) -> Result<VerificationVerdict, ExtractionError> {
        let text = normalize_text(&raw.text);

        let rule = RULES
            .iter()
            .find(|rule| rule.matches(raw, &text))
            .ok_or_else(|| ExtractionError::UnrecognizedFormat(text.chars().take(160).collect()))?;
        log::debug!("result for {identifier} matched rule {}", rule.id);

        Ok(VerificationVerdict {
            identifier: identifier.clone(),
            status: rule.status,
            raw_message: text.clone(),
            checked_at: raw.captured_at,
            device_model: device_model(&text),
        })
    }
}

/// Convenience wrapper over [`ResultExtractor::extract`].
pub fn extract(
    raw: &RawResult,
    identifier: &Identifier,
) -> Result<VerificationVerdict, ExtractionError> {
    ResultExtractor::new().extract(raw, identifier)
}

/// Device model named in the result text, either quoted or in the
/// "This IMEI is of ... device" phrase.
pub fn device_model(text: &str) -> Option<String> {
    QUOTED_MODEL_RE
        .captures(text)
        .or_else(|| DEVICE_PHRASE_RE.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|model| !model.is_empty())
}

fn normalize_text(text: &str) -> String {
    let decoded = html_escape::decode_html_entities(text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id() -> Identifier {
        Identifier::parse("359871977331199").unwrap()
    }

    fn raw(text: &str) -> RawResult {
        RawResult::new(text).captured_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn status_image_wins_over_text() {
        let result = raw("Duty on this IMEI has not been paid").with_image("/img/ok_512.png");
        assert_eq!(extract(&result, &id()).unwrap().status, VerdictStatus::Compliant);

        let result = raw("valid/compliant").with_image("/img/blocked_512.png");
        assert_eq!(
            extract(&result, &id()).unwrap().status,
            VerdictStatus::NonCompliant
        );
    }

    #[test]
    fn text_rules_apply_in_order() {
        let cases = [
            ("IMEI 359871977331199 is valid/compliant", VerdictStatus::Compliant),
            ("This device is Non-Compliant", VerdictStatus::NonCompliant),
            ("IMEI 359871977331199 is not compliant", VerdictStatus::NonCompliant),
            ("Device status: Not-Compliant", VerdictStatus::NonCompliant),
            ("Tax on this IMEI has not been paid", VerdictStatus::NonCompliant),
            ("This IMEI has been blocked by the operator", VerdictStatus::Blocked),
            ("IMEI not found in the registry", VerdictStatus::Unknown),
        ];
        for (text, expected) in cases {
            assert_eq!(extract(&raw(text), &id()).unwrap().status, expected, "{text}");
        }
    }

    #[test]
    fn unmatched_output_is_reported() {
        let err = extract(&raw("<div>Welcome to the portal</div>"), &id()).unwrap_err();
        assert!(matches!(err, ExtractionError::UnrecognizedFormat(ref s) if s.contains("Welcome")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn extraction_is_idempotent() {
        let fixture = raw("IMEI is valid/compliant. This IMEI is of &quot;Pixel 8&quot; device");
        let first = extract(&fixture, &id()).unwrap();
        let second = extract(&fixture, &id()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.checked_at, fixture.captured_at);
        assert_eq!(first.device_model.as_deref(), Some("Pixel 8"));
    }

    #[test]
    fn device_model_from_phrase() {
        assert_eq!(
            device_model("This IMEI is of Nokia 3310 device and is compliant").as_deref(),
            Some("Nokia 3310")
        );
        assert_eq!(device_model("valid/compliant"), None);
    }

    #[test]
    fn status_serializes_with_portal_names() {
        let json = serde_json::to_string(&VerdictStatus::NonCompliant).unwrap();
        assert_eq!(json, "\"Non-Compliant\"");
    }
}
