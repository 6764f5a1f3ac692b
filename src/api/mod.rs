//! Wire shapes for the HTTP surface.
//!
//! Field names are camelCase to match what existing clients of the service
//! already consume.

#[cfg(feature = "server")]
pub mod server;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extraction::{VerdictStatus, VerificationVerdict};
use crate::pipeline::{FailureKind, Outcome, Stage};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerifyRequest {
    #[serde(alias = "imei")]
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictBody {
    pub identifier: String,
    pub status: VerdictStatus,
    pub raw_message: String,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<bool>,
}

impl VerdictBody {
    fn from_verdict(verdict: VerificationVerdict, persisted: Option<bool>) -> Self {
        Self {
            identifier: verdict.identifier.to_string(),
            status: verdict.status,
            raw_message: verdict.raw_message,
            checked_at: verdict.checked_at,
            device_model: verdict.device_model,
            persisted,
        }
    }
}

impl From<VerificationVerdict> for VerdictBody {
    fn from(verdict: VerificationVerdict) -> Self {
        Self::from_verdict(verdict, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureBody {
    pub error_kind: FailureKind,
    pub message: String,
    pub stage: Stage,
    pub attempts: u32,
}

/// Body of `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum VerifyResponse {
    Verdict(VerdictBody),
    Failure(FailureBody),
}

impl VerifyResponse {
    /// HTTP status code for this response.
    pub fn status_code(&self) -> u16 {
        match self {
            VerifyResponse::Verdict(_) => 200,
            VerifyResponse::Failure(failure) => match failure.error_kind {
                FailureKind::InvalidLength | FailureKind::InvalidChecksum => 422,
                FailureKind::Busy | FailureKind::NoProvider => 503,
                FailureKind::DeadlineExceeded => 504,
                _ => 502,
            },
        }
    }
}

impl From<Outcome> for VerifyResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success { verdict, persisted } => {
                VerifyResponse::Verdict(VerdictBody::from_verdict(verdict, Some(persisted)))
            }
            Outcome::Failure {
                kind,
                stage,
                attempts,
                message,
            } => VerifyResponse::Failure(FailureBody {
                error_kind: kind,
                message,
                stage,
                attempts,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, alias = "imei")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryResponse {
    pub records: Vec<VerdictBody>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use serde_json::json;

    fn verdict() -> VerificationVerdict {
        VerificationVerdict {
            identifier: Identifier::parse("359871977331199").unwrap(),
            status: VerdictStatus::NonCompliant,
            raw_message: "Taxes are unpaid".into(),
            checked_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            device_model: Some("Galaxy A52".into()),
        }
    }

    #[test]
    fn success_serializes_camel_case() {
        let response = VerifyResponse::from(Outcome::Success {
            verdict: verdict(),
            persisted: false,
        });
        assert_eq!(response.status_code(), 200);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "identifier": "359871977331199",
                "status": "Non-Compliant",
                "rawMessage": "Taxes are unpaid",
                "checkedAt": "2024-05-01T12:00:00Z",
                "deviceModel": "Galaxy A52",
                "persisted": false
            })
        );
    }

    #[test]
    fn failure_carries_kind_stage_and_attempts() {
        let response = VerifyResponse::from(Outcome::Failure {
            kind: FailureKind::SessionTimeout,
            stage: Stage::PortalSession,
            attempts: 3,
            message: "result did not render".into(),
        });
        assert_eq!(response.status_code(), 502);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "errorKind": "session_timeout",
                "message": "result did not render",
                "stage": "portal_session",
                "attempts": 3
            })
        );
    }

    #[test]
    fn history_limit_is_bounded() {
        assert_eq!(HistoryQuery::default().limit(), DEFAULT_HISTORY_LIMIT);
        let query = HistoryQuery {
            identifier: None,
            limit: Some(10_000),
        };
        assert_eq!(query.limit(), MAX_HISTORY_LIMIT);
    }
}
