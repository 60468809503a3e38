//! Consistency audit endpoints. Operator-facing.

use axum::extract::{Path, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use tally_ledger::CleanupReport;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OrphanResponse {
    pub entity_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_credits: Decimal,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct OrphanListResponse {
    pub tenant_id: Uuid,
    pub orphans: Vec<OrphanResponse>,
}

pub async fn detect_orphans(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<OrphanListResponse>> {
    let orphans = state.ledger.auditor.detect_orphans(tenant_id).await?;
    Ok(Json(OrphanListResponse {
        tenant_id,
        orphans: orphans
            .into_iter()
            .map(|o| OrphanResponse {
                entity_id: o.entity_id,
                available_credits: o.available_credits,
                reason: o.reason,
                last_updated_at: o.last_updated_at,
            })
            .collect(),
    }))
}

pub async fn clean_orphans(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<CleanupReport>> {
    let report = state.ledger.auditor.clean_orphans(tenant_id).await?;
    Ok(Json(report))
}
