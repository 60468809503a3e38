//! Gateway webhook ingress.
//!
//! The raw body must reach signature verification byte-for-byte, so
//! this handler takes `String` instead of a typed extractor.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use tally_ledger::{LedgerError, WebhookOutcome};

use crate::error::ApiResult;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "gateway-signature";

pub async fn receive_gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivery without signature header");
            LedgerError::SignatureInvalid
        })?;

    let outcome = state.ledger.webhooks.handle_raw(&body, signature).await?;
    Ok(Json(outcome))
}
