//! Core types shared by challenge detectors, the resolver, and the portal session.

pub mod analysis;
pub mod types;

pub use analysis::{
    AnswerSlot, FormSubmission, IMAGE_ANSWER_FIELD, PortalForm, PortalParseError,
    RECAPTCHA_RESPONSE_FIELD, origin_from_url, parse_portal_form,
};
pub use types::{Challenge, ChallengeKind, DEFAULT_TOKEN_TTL, ProofToken};
