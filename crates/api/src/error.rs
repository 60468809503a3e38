//! HTTP error mapping.
//!
//! Ledger errors cross the HTTP boundary as a JSON body with a stable
//! `error` code and a human-readable `message`. Signature failures are
//! 400s so the gateway retries with backoff instead of treating the
//! endpoint as down.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tally_ledger::LedgerError;

pub struct ApiError(pub LedgerError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError(LedgerError::Database(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            LedgerError::SignatureInvalid => (StatusCode::BAD_REQUEST, "signature_invalid"),
            LedgerError::TenantNotFound(_) => (StatusCode::NOT_FOUND, "tenant_not_found"),
            LedgerError::EntityNotFound { .. } => (StatusCode::NOT_FOUND, "entity_not_found"),
            LedgerError::CampaignNotFound(_) => (StatusCode::NOT_FOUND, "campaign_not_found"),
            LedgerError::PaymentNotFound(_) => (StatusCode::NOT_FOUND, "payment_not_found"),
            LedgerError::AlreadyProcessed(_) => (StatusCode::CONFLICT, "already_processed"),
            LedgerError::InsufficientCredits { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_credits")
            }
            LedgerError::ReconciliationDrift(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "reconciliation_drift")
            }
            LedgerError::GatewayConfig(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "gateway_config_error")
            }
            LedgerError::Gateway(_) => (StatusCode::BAD_GATEWAY, "gateway_error"),
            LedgerError::Database(_) | LedgerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::warn!(error = %self.0, "Request rejected");
        }

        let body = Json(serde_json::json!({
            "error": code,
            "message": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(e: LedgerError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_of(LedgerError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(LedgerError::SignatureInvalid),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(LedgerError::CampaignNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(LedgerError::ReconciliationDrift("drift".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(LedgerError::Gateway("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(LedgerError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
