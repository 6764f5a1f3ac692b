//! axum router exposing the verifier over HTTP.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::{HistoryQuery, HistoryResponse, VerdictBody, VerifyRequest, VerifyResponse};
use crate::verifier::{Health, ImeiVerifier, VerifierError};

#[derive(Clone)]
pub struct AppState {
    verifier: Arc<ImeiVerifier>,
}

pub fn router(verifier: Arc<ImeiVerifier>) -> Router {
    let state = AppState { verifier };
    Router::new()
        .route("/verify", post(verify))
        .route("/health", get(health))
        .route("/history", get(history))
        .with_state(state)
}

async fn verify(State(st): State<AppState>, Json(req): Json<VerifyRequest>) -> Response {
    let response = VerifyResponse::from(st.verifier.verify(&req.identifier).await);
    let status = StatusCode::from_u16(response.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(response)).into_response()
}

async fn health(State(st): State<AppState>) -> (StatusCode, Json<Health>) {
    let health = st.verifier.health();
    let status = if health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn history(
    State(st): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let records = st
        .verifier
        .history(query.identifier.as_deref(), query.limit())
        .await?;
    Ok(Json(HistoryResponse {
        records: records.into_iter().map(VerdictBody::from).collect(),
    }))
}

#[derive(Debug)]
pub struct AppError(VerifierError);

impl From<VerifierError> for AppError {
    fn from(value: VerifierError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VerifierError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            VerifierError::Storage(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("request failed: {}", self.0);
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string()
        }));
        (status, body).into_response()
    }
}
