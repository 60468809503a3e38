//! Seasonal campaign endpoints.

use axum::extract::{Path, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tally_ledger::{
    CreateCampaignInput, DistributionSummary, ExpirySweepSummary, LedgerError, SeasonalCampaign,
    SeasonalCreditAllocation,
};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    pub credit_type: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_credits: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub credits_per_tenant: Option<Decimal>,
    pub distribution_method: String,
    pub allocation_mode: String,
    pub target_tenant_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub target_applications: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct CampaignResponse {
    pub id: Uuid,
    pub name: String,
    pub credit_type: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_credits: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "rust_decimal::serde::str_option")]
    pub credits_per_tenant: Option<Decimal>,
    pub distribution_method: String,
    pub allocation_mode: String,
    pub target_applications: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub distribution_status: String,
    pub distributed_count: i32,
    pub failed_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<SeasonalCampaign> for CampaignResponse {
    fn from(c: SeasonalCampaign) -> Self {
        Self {
            id: c.id,
            name: c.name,
            credit_type: c.credit_type,
            total_credits: c.total_credits,
            credits_per_tenant: c.credits_per_tenant,
            distribution_method: c.distribution_method,
            allocation_mode: c.allocation_mode,
            target_applications: c.target_applications,
            expires_at: c.expires_at,
            distribution_status: c.distribution_status,
            distributed_count: c.distributed_count,
            failed_count: c.failed_count,
            created_at: c.created_at,
        }
    }
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CreateCampaignRequest>,
) -> ApiResult<Json<CampaignResponse>> {
    let input = CreateCampaignInput {
        name: request.name,
        credit_type: request.credit_type,
        total_credits: request.total_credits,
        credits_per_tenant: request.credits_per_tenant,
        distribution_method: request.distribution_method,
        allocation_mode: request.allocation_mode,
        target_tenant_ids: request.target_tenant_ids,
        target_applications: request.target_applications,
        expires_at: request.expires_at,
    };

    let campaign = state.ledger.campaigns.create_campaign(&input).await?;
    Ok(Json(campaign.into()))
}

pub async fn list_campaigns(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<CampaignResponse>>> {
    let campaigns = state.ledger.campaigns.list_campaigns().await?;
    Ok(Json(campaigns.into_iter().map(Into::into).collect()))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state.ledger.campaigns.get_campaign(id).await?;
    Ok(Json(campaign.into()))
}

pub async fn distribute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DistributionSummary>> {
    let summary = state.ledger.campaigns.distribute(id).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
pub struct DistributionStatusResponse {
    pub campaign_id: Uuid,
    pub distribution_status: String,
    pub distributed_count: i32,
    pub failed_count: i32,
}

pub async fn distribution_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DistributionStatusResponse>> {
    let campaign = state.ledger.campaigns.get_campaign(id).await?;
    Ok(Json(DistributionStatusResponse {
        campaign_id: campaign.id,
        distribution_status: campaign.distribution_status,
        distributed_count: campaign.distributed_count,
        failed_count: campaign.failed_count,
    }))
}

#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_id: Option<Uuid>,
    pub target_application: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub allocated_credits: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub used_credits: Decimal,
    pub distribution_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub is_expired: bool,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl From<SeasonalCreditAllocation> for AllocationResponse {
    fn from(a: SeasonalCreditAllocation) -> Self {
        Self {
            id: a.id,
            tenant_id: a.tenant_id,
            entity_id: a.entity_id,
            target_application: a.target_application,
            allocated_credits: a.allocated_credits,
            used_credits: a.used_credits,
            distribution_status: a.distribution_status,
            error_message: a.error_message,
            is_expired: a.is_expired,
            is_active: a.is_active,
            expires_at: a.expires_at,
        }
    }
}

pub async fn list_allocations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<AllocationResponse>>> {
    // 404 for unknown campaigns instead of an empty list.
    state.ledger.campaigns.get_campaign(id).await?;
    let allocations = state.ledger.campaigns.list_allocations(id).await?;
    Ok(Json(allocations.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct ExtendExpiryRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub new_expires_at: OffsetDateTime,
}

pub async fn extend_expiry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ExtendExpiryRequest>,
) -> ApiResult<Json<CampaignResponse>> {
    let campaign = state
        .ledger
        .campaigns
        .extend_expiry(id, request.new_expires_at)
        .await?;
    Ok(Json(campaign.into()))
}

#[derive(Debug, Deserialize)]
pub struct NotifyExpiryRequest {
    pub days_ahead: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct NotifyExpiryResponse {
    pub warnings_enqueued: usize,
}

pub async fn notify_expiry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<NotifyExpiryRequest>,
) -> ApiResult<Json<NotifyExpiryResponse>> {
    state.ledger.campaigns.get_campaign(id).await?;
    let days_ahead = request.days_ahead.unwrap_or(7);
    if days_ahead <= 0 {
        return Err(LedgerError::Validation("days_ahead must be positive".into()).into());
    }

    let warnings_enqueued = state.ledger.campaigns.send_expiry_warnings(days_ahead).await?;
    Ok(Json(NotifyExpiryResponse { warnings_enqueued }))
}

pub async fn expiry_sweep(State(state): State<AppState>) -> ApiResult<Json<ExpirySweepSummary>> {
    let summary = state.ledger.campaigns.process_expiries().await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn create_request_parses_decimal_strings() {
        let body = serde_json::json!({
            "name": "Winter credits",
            "credit_type": "promotional",
            "total_credits": "1000",
            "credits_per_tenant": "250",
            "distribution_method": "equal",
            "allocation_mode": "shared",
            "target_tenant_ids": null,
            "expires_at": "2026-12-31T00:00:00Z"
        });
        let request: CreateCampaignRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.total_credits, dec!(1000));
        assert_eq!(request.credits_per_tenant, Some(dec!(250)));
        assert!(request.target_applications.is_empty());
    }

    #[test]
    fn create_request_allows_missing_per_tenant() {
        let body = serde_json::json!({
            "name": "Winter credits",
            "credit_type": "promotional",
            "total_credits": "1000",
            "distribution_method": "equal",
            "allocation_mode": "shared",
            "expires_at": "2026-12-31T00:00:00Z"
        });
        let request: CreateCampaignRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.credits_per_tenant, None);
    }
}
