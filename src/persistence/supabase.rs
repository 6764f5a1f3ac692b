use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Ack, StorageBackend, StorageError};
use crate::extraction::{VerdictStatus, VerificationVerdict};
use crate::identifier::Identifier;

pub const DEFAULT_TABLE: &str = "imei_verification_results";

/// PostgREST-backed store on a Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    base_url: Url,
    api_key: String,
    table: String,
    client: Client,
}

impl SupabaseStorage {
    pub fn new(base_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            base_url,
            api_key: api_key.into(),
            table: DEFAULT_TABLE.to_string(),
            client: Client::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn table_url(&self) -> Result<Url, StorageError> {
        self.base_url
            .join(&format!("rest/v1/{}", self.table))
            .map_err(|err| StorageError::Rejected(format!("invalid supabase url: {err}")))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Details {
    raw_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_model: Option<String>,
}

/// Row shape of the `imei_verification_results` table.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    imei: String,
    status: String,
    details: Option<Details>,
    error_message: Option<String>,
    verification_date: DateTime<Utc>,
}

impl From<&VerificationVerdict> for Row {
    fn from(verdict: &VerificationVerdict) -> Self {
        Row {
            imei: verdict.identifier.to_string(),
            status: verdict.status.as_str().to_string(),
            details: Some(Details {
                raw_text: verdict.raw_message.clone(),
                device_model: verdict.device_model.clone(),
            }),
            error_message: None,
            verification_date: verdict.checked_at,
        }
    }
}

impl Row {
    /// Rows written by other tools may carry statuses this crate never produces.
    fn into_verdict(self) -> Option<VerificationVerdict> {
        let status = match self.status.as_str() {
            "Compliant" => VerdictStatus::Compliant,
            "Non-Compliant" => VerdictStatus::NonCompliant,
            "Blocked" => VerdictStatus::Blocked,
            "Unknown" => VerdictStatus::Unknown,
            other => {
                log::debug!("skipping history row with status {other:?}");
                return None;
            }
        };
        let identifier = Identifier::parse(&self.imei).ok()?;
        let details = self.details.unwrap_or(Details {
            raw_text: String::new(),
            device_model: None,
        });
        Some(VerificationVerdict {
            identifier,
            status,
            raw_message: details.raw_text,
            checked_at: self.verification_date,
            device_model: details.device_model,
        })
    }
}

fn classify_status(status: StatusCode, body: &str) -> Result<(), StorageError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(StorageError::Transient(message))
    } else {
        Err(StorageError::Rejected(message))
    }
}

fn transport(err: reqwest::Error) -> StorageError {
    StorageError::Transient(err.to_string())
}

#[async_trait]
impl StorageBackend for SupabaseStorage {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn append(&self, verdict: &VerificationVerdict) -> Result<Ack, StorageError> {
        let response = self
            .authorized(self.client.post(self.table_url()?))
            .header("Prefer", "return=minimal")
            .json(&Row::from(verdict))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        classify_status(status, &body)?;
        Ok(Ack::new(None))
    }

    async fn history(
        &self,
        identifier: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<VerificationVerdict>, StorageError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", "verification_date.desc".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(id) = identifier {
            query.push(("imei", format!("eq.{id}")));
        }

        let response = self
            .authorized(self.client.get(self.table_url()?))
            .query(&query)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        classify_status(status, &body)?;

        let rows: Vec<Row> =
            serde_json::from_str(&body).map_err(|err| StorageError::Corrupt(err.to_string()))?;
        Ok(rows.into_iter().filter_map(Row::into_verdict).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::fixtures::verdict;

    #[test]
    fn rows_use_portal_status_names() {
        let mut v = verdict("359871977331199", VerdictStatus::NonCompliant, 5);
        v.device_model = Some("Galaxy S21".into());
        let json = serde_json::to_value(Row::from(&v)).unwrap();
        assert_eq!(json["imei"], "359871977331199");
        assert_eq!(json["status"], "Non-Compliant");
        assert_eq!(json["details"]["device_model"], "Galaxy S21");
        assert!(json["error_message"].is_null());
    }

    #[test]
    fn history_rows_decode_and_skip_errors() {
        let body = r#"[
            {"imei":"359871977331199","status":"Compliant","details":{"raw_text":"valid/compliant"},
             "error_message":null,"verification_date":"2024-05-01T12:00:00+00:00"},
            {"imei":"359871977331199","status":"Error","details":null,
             "error_message":"timeout","verification_date":"2024-05-01T11:00:00+00:00"}
        ]"#;
        let rows: Vec<Row> = serde_json::from_str(body).unwrap();
        let verdicts: Vec<_> = rows.into_iter().filter_map(Row::into_verdict).collect();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].raw_message, "valid/compliant");
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "down"),
            Err(StorageError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            Err(StorageError::Rejected(_))
        ));
        assert!(classify_status(StatusCode::CREATED, "").is_ok());
    }

    #[test]
    fn table_url_is_under_rest_v1() {
        let store = SupabaseStorage::new(Url::parse("https://proj.supabase.co/").unwrap(), "key");
        assert_eq!(
            store.table_url().unwrap().as_str(),
            "https://proj.supabase.co/rest/v1/imei_verification_results"
        );
    }
}
