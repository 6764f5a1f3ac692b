//! Challenge detection module.
//!
//! Provides pattern-based identification of the captcha widgets the portal
//! renders in front of its lookup form.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::challenges::core::ChallengeKind;

/// Result of matching a page against the known challenge signatures.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeDetection {
    pub kind: ChallengeKind,
    pub pattern_id: &'static str,
    pub confidence: f32,
    /// Image source for static challenges (URL or `data:` URI).
    pub image_src: Option<String>,
    /// Widget site key for interactive challenges.
    pub site_key: Option<String>,
}

/// Pattern definition used to match pages against known challenge signatures.
#[derive(Debug)]
struct ChallengePattern {
    id: &'static str,
    kind: ChallengeKind,
    base_confidence: f32,
    patterns: Vec<Regex>,
}

impl ChallengePattern {
    fn new(
        id: &'static str,
        kind: ChallengeKind,
        base_confidence: f32,
        raw_patterns: &[&str],
    ) -> Self {
        Self {
            id,
            kind,
            base_confidence,
            patterns: raw_patterns.iter().map(|p| build_regex(p)).collect(),
        }
    }

    /// Confidence scaled by the share of signatures present.
    fn score(&self, body: &str) -> Option<f32> {
        let hits = self.patterns.iter().filter(|p| p.is_match(body)).count();
        (hits > 0).then(|| self.base_confidence * hits as f32 / self.patterns.len() as f32)
    }
}

static KNOWN_PATTERNS: Lazy<Vec<ChallengePattern>> = Lazy::new(|| {
    vec![
        ChallengePattern::new(
            "dirbs_image_captcha",
            ChallengeKind::StaticImage,
            0.95,
            &[
                r#"<img[^>]*id=['"]captchaimg['"]"#,
                r#"<input[^>]*(?:id|name)=['"]txtCaptcha['"]"#,
            ],
        ),
        ChallengePattern::new(
            "recaptcha_v2",
            ChallengeKind::Interactive,
            0.98,
            &[
                r#"class=['"][^'"]*g-recaptcha[^'"]*['"]"#,
                r#"<iframe[^>]*title=['"]reCAPTCHA['"]"#,
                r#"src=['"]https://www\.(?:google|recaptcha)\.(?:com|net)/recaptcha/api\.js"#,
            ],
        ),
    ]
});

/// Stateless detector over rendered portal HTML.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChallengeDetector;

impl ChallengeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Identify the challenge rendered on the page, if any.
    ///
    /// Interactive widgets win ties because the portal falls back to the
    /// image captcha markup when the widget script is blocked.
    pub fn detect(&self, body: &str) -> Option<ChallengeDetection> {
        let (pattern, confidence) = KNOWN_PATTERNS
            .iter()
            .filter_map(|pattern| pattern.score(body).map(|score| (pattern, score)))
            .max_by(|(a, sa), (b, sb)| {
                sa.total_cmp(sb)
                    .then_with(|| kind_rank(a.kind).cmp(&kind_rank(b.kind)))
            })?;

        match pattern.kind {
            ChallengeKind::StaticImage => Some(ChallengeDetection {
                kind: pattern.kind,
                pattern_id: pattern.id,
                confidence,
                image_src: capture(&CAPTCHA_IMG_SRC_RE, body),
                site_key: None,
            }),
            ChallengeKind::Interactive => {
                let site_key = capture(&SITE_KEY_RE, body);
                if site_key.is_none() {
                    log::warn!("interactive challenge markup without a site key");
                }
                Some(ChallengeDetection {
                    kind: pattern.kind,
                    pattern_id: pattern.id,
                    confidence,
                    image_src: None,
                    site_key,
                })
            }
        }
    }

    /// Whether the identifier input is present, i.e. the form is usable.
    pub fn has_identifier_input(&self, body: &str) -> bool {
        IDENTIFIER_INPUT_RE.is_match(body)
    }
}

fn kind_rank(kind: ChallengeKind) -> u8 {
    match kind {
        ChallengeKind::StaticImage => 0,
        ChallengeKind::Interactive => 1,
    }
}

/// First non-empty capture group; alternations put the value in different slots.
fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|caps| caps.iter().skip(1).flatten().next())
        .map(|m| html_escape::decode_html_entities(m.as_str()).into_owned())
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid challenge pattern")
}

static CAPTCHA_IMG_SRC_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r#"<img[^>]*id=['"]captchaimg['"][^>]*src=['"]([^'"]+)['"]|<img[^>]*src=['"]([^'"]+)['"][^>]*id=['"]captchaimg['"]"#)
});

static SITE_KEY_RE: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"data-sitekey=['"]([0-9A-Za-z_-]{20,})['"]"#));

static IDENTIFIER_INPUT_RE: Lazy<Regex> =
    Lazy::new(|| build_regex(r#"<input[^>]*(?:id|name)=['"]imei['"]"#));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_image_captcha_with_source() {
        let body = r#"<form><input id="imei"/><img id="captchaimg" src="/Captcha.aspx?r=1" />
            <input id="txtCaptcha" name="txtCaptcha"/></form>"#;
        let detection = ChallengeDetector::new().detect(body).expect("challenge");
        assert_eq!(detection.kind, ChallengeKind::StaticImage);
        assert_eq!(detection.image_src.as_deref(), Some("/Captcha.aspx?r=1"));
        assert!((detection.confidence - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn detects_image_source_before_id() {
        let body = r#"<img src="data:image/png;base64,AAAA" id="captchaimg">"#;
        let detection = ChallengeDetector::new().detect(body).expect("challenge");
        assert_eq!(
            detection.image_src.as_deref(),
            Some("data:image/png;base64,AAAA")
        );
        assert!(detection.confidence < 0.95);
    }

    #[test]
    fn detects_recaptcha_site_key() {
        let body = r#"<div class="g-recaptcha" data-sitekey="6LcAbCdEfGhIjKlMnOpQrStUvWxYz0123456789"></div>
            <script src="https://www.google.com/recaptcha/api.js"></script>"#;
        let detection = ChallengeDetector::new().detect(body).expect("challenge");
        assert_eq!(detection.kind, ChallengeKind::Interactive);
        assert_eq!(
            detection.site_key.as_deref(),
            Some("6LcAbCdEfGhIjKlMnOpQrStUvWxYz0123456789")
        );
    }

    #[test]
    fn plain_form_has_no_challenge() {
        let body = r#"<form><input type="text" id="imei" name="imei"></form>"#;
        let detector = ChallengeDetector::new();
        assert!(detector.detect(body).is_none());
        assert!(detector.has_identifier_input(body));
    }
}
