//! Seasonal credit campaigns: bulk distribution and expiry clawback.
//!
//! Distribution is intentionally sequential across tenants: isolation
//! over throughput. One tenant's failure is recorded as a failed
//! allocation row and the batch continues; counters on the campaign
//! row checkpoint progress between tenants.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditService, TransactionType};
use crate::directory::EntityDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::notify::NotificationQueue;

/// A campaign stuck in `processing` longer than this is treated as an
/// interrupted run and may be claimed again. Per-tenant idempotency
/// keys make the re-run safe.
const DISTRIBUTION_TIMEOUT_MINUTES: i64 = 30;

/// Campaign distribution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionStatus {
    Pending,
    Processing,
    Completed,
    PartialSuccess,
    Failed,
}

impl DistributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionStatus::Pending => "pending",
            DistributionStatus::Processing => "processing",
            DistributionStatus::Completed => "completed",
            DistributionStatus::PartialSuccess => "partial_success",
            DistributionStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DistributionStatus::Pending),
            "processing" => Some(DistributionStatus::Processing),
            "completed" => Some(DistributionStatus::Completed),
            "partial_success" => Some(DistributionStatus::PartialSuccess),
            "failed" => Some(DistributionStatus::Failed),
            _ => None,
        }
    }

    /// Final status from the distribution counters.
    pub fn from_counts(distributed: i32, failed: i32) -> Self {
        if failed == 0 {
            DistributionStatus::Completed
        } else if distributed == 0 {
            DistributionStatus::Failed
        } else {
            DistributionStatus::PartialSuccess
        }
    }
}

impl std::fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Campaign row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeasonalCampaign {
    pub id: Uuid,
    pub name: String,
    pub credit_type: String,
    pub total_credits: Decimal,
    pub credits_per_tenant: Option<Decimal>,
    pub distribution_method: String,
    pub allocation_mode: String,
    pub target_tenant_ids: Option<Vec<Uuid>>,
    pub target_applications: Vec<String>,
    pub expires_at: OffsetDateTime,
    pub distribution_status: String,
    pub distribution_started_at: Option<OffsetDateTime>,
    pub distributed_count: i32,
    pub failed_count: i32,
    pub created_at: OffsetDateTime,
}

/// Per-(campaign, tenant, entity[, application]) allocation row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeasonalCreditAllocation {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub entity_id: Option<Uuid>,
    pub target_application: Option<String>,
    pub allocated_credits: Decimal,
    pub used_credits: Decimal,
    pub distribution_status: String,
    pub error_message: Option<String>,
    pub is_expired: bool,
    pub is_active: bool,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Input for creating a campaign.
#[derive(Debug, Clone)]
pub struct CreateCampaignInput {
    pub name: String,
    pub credit_type: String,
    pub total_credits: Decimal,
    pub credits_per_tenant: Option<Decimal>,
    /// "equal" divides total_credits across targets; "flat" grants
    /// total_credits to every target (unless credits_per_tenant set).
    pub distribution_method: String,
    /// "shared" or "application_specific".
    pub allocation_mode: String,
    /// None targets all active tenants.
    pub target_tenant_ids: Option<Vec<Uuid>>,
    pub target_applications: Vec<String>,
    pub expires_at: OffsetDateTime,
}

impl CreateCampaignInput {
    /// Reject malformed campaigns before any row is written.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::Validation("campaign name is required".into()));
        }
        if self.total_credits <= Decimal::ZERO {
            return Err(LedgerError::Validation(
                "total_credits must be positive".into(),
            ));
        }
        if let Some(per_tenant) = self.credits_per_tenant {
            if per_tenant <= Decimal::ZERO {
                return Err(LedgerError::Validation(
                    "credits_per_tenant must be positive".into(),
                ));
            }
        }
        if !matches!(self.distribution_method.as_str(), "equal" | "flat") {
            return Err(LedgerError::Validation(format!(
                "unknown distribution_method '{}'",
                self.distribution_method
            )));
        }
        if !matches!(self.allocation_mode.as_str(), "shared" | "application_specific") {
            return Err(LedgerError::Validation(format!(
                "unknown allocation_mode '{}'",
                self.allocation_mode
            )));
        }
        if self.allocation_mode == "application_specific" && self.target_applications.is_empty() {
            return Err(LedgerError::Validation(
                "application_specific campaigns need target_applications".into(),
            ));
        }
        if let Some(ids) = &self.target_tenant_ids {
            if ids.is_empty() {
                return Err(LedgerError::Validation(
                    "target_tenant_ids must be non-empty when supplied".into(),
                ));
            }
        }
        if self.expires_at <= OffsetDateTime::now_utc() {
            return Err(LedgerError::Validation(
                "expires_at must be in the future".into(),
            ));
        }
        Ok(())
    }
}

/// Result of one distribution run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DistributionSummary {
    pub campaign_id: Uuid,
    pub target_count: usize,
    pub distributed_count: i32,
    pub failed_count: i32,
    pub final_status: String,
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExpirySweepSummary {
    pub scanned: usize,
    pub expired: usize,
    #[serde(with = "rust_decimal::serde::str")]
    pub credits_clawed_back: Decimal,
}

/// Per-tenant credit amount for a campaign.
pub fn tenant_share(
    credits_per_tenant: Option<Decimal>,
    distribution_method: &str,
    total_credits: Decimal,
    tenant_count: usize,
) -> Decimal {
    if let Some(per_tenant) = credits_per_tenant {
        return per_tenant;
    }
    if distribution_method == "equal" && tenant_count > 0 {
        return (total_credits / Decimal::from(tenant_count as u64)).round_dp(2);
    }
    total_credits
}

/// Split an entity-level grant evenly across applications.
///
/// Rows must sum exactly to the grant, so the last application absorbs
/// the rounding remainder.
pub fn split_across_applications(amount: Decimal, applications: &[String]) -> Vec<(String, Decimal)> {
    if applications.is_empty() {
        return Vec::new();
    }
    let n = Decimal::from(applications.len() as u64);
    let share = (amount / n).round_dp(2);
    let mut rows: Vec<(String, Decimal)> = Vec::with_capacity(applications.len());
    let mut allocated = Decimal::ZERO;
    for (i, app) in applications.iter().enumerate() {
        let portion = if i + 1 == applications.len() {
            amount - allocated
        } else {
            share
        };
        allocated += portion;
        rows.push((app.clone(), portion));
    }
    rows
}

/// Unused credit to debit on expiry, clamped so the balance never
/// goes negative (plan credits may have been otherwise consumed).
pub fn clawback_amount(allocated: Decimal, used: Decimal, available: Decimal) -> Decimal {
    let unused = (allocated - used).max(Decimal::ZERO);
    unused.min(available.max(Decimal::ZERO))
}

/// Whether a distribution run may claim the campaign.
///
/// Pending campaigns always; a `processing` campaign only once its run
/// start is older than the timeout (the run is presumed interrupted).
/// Finished campaigns never.
pub fn distribution_claimable(
    status: &str,
    started_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    match status {
        "pending" => true,
        "processing" => started_at
            .is_none_or(|t| now - t > time::Duration::minutes(DISTRIBUTION_TIMEOUT_MINUTES)),
        _ => false,
    }
}

/// Service over campaigns and allocations.
#[derive(Clone)]
pub struct CampaignService {
    pool: PgPool,
    credits: CreditService,
    directory: EntityDirectory,
    notifications: NotificationQueue,
}

impl CampaignService {
    pub fn new(pool: PgPool) -> Self {
        let directory = EntityDirectory::new(pool.clone());
        Self {
            credits: CreditService::new(pool.clone(), directory.clone()),
            notifications: NotificationQueue::new(pool.clone()),
            directory,
            pool,
        }
    }

    pub async fn create_campaign(&self, input: &CreateCampaignInput) -> LedgerResult<SeasonalCampaign> {
        input.validate()?;

        let campaign: SeasonalCampaign = sqlx::query_as(
            r#"
            INSERT INTO seasonal_campaigns
                (id, name, credit_type, total_credits, credits_per_tenant,
                 distribution_method, allocation_mode, target_tenant_ids,
                 target_applications, expires_at, distribution_status,
                 distributed_count, failed_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', 0, 0, NOW())
            RETURNING id, name, credit_type, total_credits, credits_per_tenant,
                      distribution_method, allocation_mode, target_tenant_ids,
                      target_applications, expires_at, distribution_status,
                      distribution_started_at, distributed_count, failed_count, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.credit_type)
        .bind(input.total_credits)
        .bind(input.credits_per_tenant)
        .bind(&input.distribution_method)
        .bind(&input.allocation_mode)
        .bind(input.target_tenant_ids.as_deref())
        .bind(&input.target_applications)
        .bind(input.expires_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            campaign_id = %campaign.id,
            name = %campaign.name,
            total_credits = %campaign.total_credits,
            "Seasonal campaign created"
        );

        Ok(campaign)
    }

    pub async fn get_campaign(&self, campaign_id: Uuid) -> LedgerResult<SeasonalCampaign> {
        let campaign: Option<SeasonalCampaign> = sqlx::query_as(
            r#"
            SELECT id, name, credit_type, total_credits, credits_per_tenant,
                   distribution_method, allocation_mode, target_tenant_ids,
                   target_applications, expires_at, distribution_status,
                   distribution_started_at, distributed_count, failed_count, created_at
            FROM seasonal_campaigns
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        campaign.ok_or(LedgerError::CampaignNotFound(campaign_id))
    }

    pub async fn list_campaigns(&self) -> LedgerResult<Vec<SeasonalCampaign>> {
        let campaigns: Vec<SeasonalCampaign> = sqlx::query_as(
            r#"
            SELECT id, name, credit_type, total_credits, credits_per_tenant,
                   distribution_method, allocation_mode, target_tenant_ids,
                   target_applications, expires_at, distribution_status,
                   distribution_started_at, distributed_count, failed_count, created_at
            FROM seasonal_campaigns
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(campaigns)
    }

    pub async fn list_allocations(
        &self,
        campaign_id: Uuid,
    ) -> LedgerResult<Vec<SeasonalCreditAllocation>> {
        let allocations: Vec<SeasonalCreditAllocation> = sqlx::query_as(
            r#"
            SELECT id, campaign_id, tenant_id, entity_id, target_application,
                   allocated_credits, used_credits, distribution_status,
                   error_message, is_expired, is_active, expires_at, created_at
            FROM seasonal_credit_allocations
            WHERE campaign_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(allocations)
    }

    /// Run distribution for a pending campaign, or resume one whose
    /// previous run was interrupted.
    pub async fn distribute(&self, campaign_id: Uuid) -> LedgerResult<DistributionSummary> {
        // Claim the campaign under a row lock so a double-trigger
        // cannot run the batch twice. A run that crashed mid-batch
        // leaves the campaign in 'processing'; once the timeout
        // passes it can be claimed again and resumed, with the
        // per-tenant idempotency keys preventing double grants.
        let mut tx = self.pool.begin().await?;

        let campaign: Option<SeasonalCampaign> = sqlx::query_as(
            r#"
            SELECT id, name, credit_type, total_credits, credits_per_tenant,
                   distribution_method, allocation_mode, target_tenant_ids,
                   target_applications, expires_at, distribution_status,
                   distribution_started_at, distributed_count, failed_count, created_at
            FROM seasonal_campaigns
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(campaign) = campaign else {
            tx.rollback().await?;
            return Err(LedgerError::CampaignNotFound(campaign_id));
        };

        if !distribution_claimable(
            &campaign.distribution_status,
            campaign.distribution_started_at,
            OffsetDateTime::now_utc(),
        ) {
            tx.rollback().await?;
            return Err(LedgerError::Validation(format!(
                "campaign {} is '{}', only pending or interrupted campaigns can be distributed",
                campaign_id, campaign.distribution_status
            )));
        }

        sqlx::query(
            r#"
            UPDATE seasonal_campaigns
            SET distribution_status = 'processing', distribution_started_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let targets = self.resolve_targets(&campaign).await?;
        let share = tenant_share(
            campaign.credits_per_tenant,
            &campaign.distribution_method,
            campaign.total_credits,
            targets.len(),
        );

        tracing::info!(
            campaign_id = %campaign.id,
            targets = targets.len(),
            per_tenant_credits = %share,
            "Starting campaign distribution"
        );

        let mut distributed = 0i32;
        let mut failed = 0i32;

        for tenant_id in &targets {
            match self.distribute_to_tenant(&campaign, *tenant_id, share).await {
                Ok(()) => distributed += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        campaign_id = %campaign.id,
                        tenant_id = %tenant_id,
                        error = %e,
                        "Campaign distribution failed for tenant"
                    );
                    self.record_failed_allocation(&campaign, *tenant_id, &e.to_string())
                        .await;
                }
            }

            // Checkpoint after every tenant so an interrupted run
            // shows its progress.
            if let Err(e) = sqlx::query(
                r#"
                UPDATE seasonal_campaigns
                SET distributed_count = $2, failed_count = $3
                WHERE id = $1
                "#,
            )
            .bind(campaign.id)
            .bind(distributed)
            .bind(failed)
            .execute(&self.pool)
            .await
            {
                tracing::error!(campaign_id = %campaign.id, error = %e, "Failed to checkpoint campaign counters");
            }
        }

        let final_status = DistributionStatus::from_counts(distributed, failed);
        sqlx::query("UPDATE seasonal_campaigns SET distribution_status = $2 WHERE id = $1")
            .bind(campaign.id)
            .bind(final_status.as_str())
            .execute(&self.pool)
            .await?;

        tracing::info!(
            campaign_id = %campaign.id,
            distributed = distributed,
            failed = failed,
            final_status = %final_status,
            "Campaign distribution complete"
        );

        Ok(DistributionSummary {
            campaign_id: campaign.id,
            target_count: targets.len(),
            distributed_count: distributed,
            failed_count: failed,
            final_status: final_status.as_str().to_string(),
        })
    }

    async fn resolve_targets(&self, campaign: &SeasonalCampaign) -> LedgerResult<Vec<Uuid>> {
        if let Some(ids) = &campaign.target_tenant_ids {
            return Ok(ids.clone());
        }

        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM tenants WHERE is_active = true ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Grant one tenant its share: one balance mutation, then the
    /// allocation row(s).
    async fn distribute_to_tenant(
        &self,
        campaign: &SeasonalCampaign,
        tenant_id: Uuid,
        amount: Decimal,
    ) -> LedgerResult<()> {
        let org = self
            .directory
            .find_primary_organization(tenant_id)
            .await?
            .ok_or_else(|| {
                LedgerError::ReconciliationDrift(format!(
                    "tenant {} has no primary organization",
                    tenant_id
                ))
            })?;

        // The campaign id keys idempotency per tenant: re-running an
        // interrupted distribution cannot double-grant.
        let code = format!("seasonal_campaign:{}", campaign.id);
        self.credits
            .apply_delta(
                tenant_id,
                org.id,
                amount,
                TransactionType::SeasonalCampaign,
                &code,
                Some(&code),
            )
            .await?;

        // The entity balance holds the full grant; application rows
        // record the per-application split for usage tracking.
        let rows: Vec<(Option<String>, Decimal)> = if campaign.allocation_mode
            == "application_specific"
        {
            split_across_applications(amount, &campaign.target_applications)
                .into_iter()
                .map(|(app, portion)| (Some(app), portion))
                .collect()
        } else {
            vec![(None, amount)]
        };

        for (application, portion) in rows {
            sqlx::query(
                r#"
                INSERT INTO seasonal_credit_allocations
                    (id, campaign_id, tenant_id, entity_id, target_application,
                     allocated_credits, used_credits, distribution_status,
                     is_expired, is_active, expires_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, 0, 'completed', false, true, $7, NOW())
                ON CONFLICT (campaign_id, tenant_id, target_application) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(campaign.id)
            .bind(tenant_id)
            .bind(org.id)
            .bind(application.as_deref())
            .bind(portion)
            .bind(campaign.expires_at)
            .execute(&self.pool)
            .await?;
        }

        self.notifications
            .enqueue(
                tenant_id,
                "seasonal_credits_granted",
                serde_json::json!({
                    "campaign_id": campaign.id,
                    "campaign_name": campaign.name,
                    "credits": amount.to_string(),
                    "expires_at": campaign.expires_at.to_string(),
                }),
            )
            .await?;

        Ok(())
    }

    async fn record_failed_allocation(
        &self,
        campaign: &SeasonalCampaign,
        tenant_id: Uuid,
        error_message: &str,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO seasonal_credit_allocations
                (id, campaign_id, tenant_id, entity_id, target_application,
                 allocated_credits, used_credits, distribution_status,
                 error_message, is_expired, is_active, expires_at, created_at)
            VALUES ($1, $2, $3, NULL, NULL, 0, 0, 'failed', $4, false, false, $5, NOW())
            ON CONFLICT (campaign_id, tenant_id, target_application) DO UPDATE SET
                distribution_status = 'failed',
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(campaign.id)
        .bind(tenant_id)
        .bind(error_message)
        .bind(campaign.expires_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                campaign_id = %campaign.id,
                tenant_id = %tenant_id,
                error = %e,
                "Failed to record failed allocation row"
            );
        }
    }

    /// Sweep expired allocations and claw back unused credit.
    ///
    /// Idempotent per allocation: the expired flag is claimed with a
    /// conditional UPDATE and the clawback debit carries the
    /// allocation id as its idempotency key.
    pub async fn process_expiries(&self) -> LedgerResult<ExpirySweepSummary> {
        let due: Vec<SeasonalCreditAllocation> = sqlx::query_as(
            r#"
            SELECT id, campaign_id, tenant_id, entity_id, target_application,
                   allocated_credits, used_credits, distribution_status,
                   error_message, is_expired, is_active, expires_at, created_at
            FROM seasonal_credit_allocations
            WHERE is_active = true AND is_expired = false AND expires_at <= NOW()
            ORDER BY expires_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ExpirySweepSummary {
            scanned: due.len(),
            ..Default::default()
        };

        for allocation in due {
            let claimed = sqlx::query(
                r#"
                UPDATE seasonal_credit_allocations
                SET is_expired = true, is_active = false
                WHERE id = $1 AND is_expired = false
                "#,
            )
            .bind(allocation.id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                continue;
            }
            summary.expired += 1;

            let Some(entity_id) = allocation.entity_id else {
                continue;
            };

            let balance = self
                .credits
                .get_balance(allocation.tenant_id, entity_id)
                .await?;
            let debit = clawback_amount(
                allocation.allocated_credits,
                allocation.used_credits,
                balance.available_credits,
            );

            if debit > Decimal::ZERO {
                let code = format!("seasonal_expiry:{}", allocation.id);
                let result = self
                    .credits
                    .apply_delta(
                        allocation.tenant_id,
                        entity_id,
                        -debit,
                        TransactionType::Expiry,
                        &code,
                        Some(&code),
                    )
                    .await;

                match result {
                    Ok(outcome) if outcome.applied => {
                        // The debit is floored at the live balance
                        // inside the locked unit, so account what was
                        // actually taken, not what was requested.
                        summary.credits_clawed_back +=
                            outcome.previous_balance - outcome.new_balance;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // The allocation is already marked expired;
                        // surface the miss for manual repair.
                        tracing::error!(
                            allocation_id = %allocation.id,
                            tenant_id = %allocation.tenant_id,
                            error = %e,
                            "Expiry clawback debit failed"
                        );
                    }
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            expired = summary.expired,
            credits_clawed_back = %summary.credits_clawed_back,
            "Expiry sweep complete"
        );

        Ok(summary)
    }

    /// Push a campaign's expiry out, including its live allocations.
    pub async fn extend_expiry(
        &self,
        campaign_id: Uuid,
        new_expires_at: OffsetDateTime,
    ) -> LedgerResult<SeasonalCampaign> {
        let campaign = self.get_campaign(campaign_id).await?;
        if new_expires_at <= campaign.expires_at {
            return Err(LedgerError::Validation(
                "new expiry must be later than the current expiry".into(),
            ));
        }

        sqlx::query("UPDATE seasonal_campaigns SET expires_at = $2 WHERE id = $1")
            .bind(campaign_id)
            .bind(new_expires_at)
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            UPDATE seasonal_credit_allocations
            SET expires_at = $2
            WHERE campaign_id = $1 AND is_expired = false
            "#,
        )
        .bind(campaign_id)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await?;

        self.get_campaign(campaign_id).await
    }

    /// Enqueue expiry warnings for allocations expiring soon.
    pub async fn send_expiry_warnings(&self, days_ahead: i64) -> LedgerResult<usize> {
        let horizon = OffsetDateTime::now_utc() + time::Duration::days(days_ahead);

        let expiring: Vec<(Uuid, Uuid, Decimal, Decimal, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT a.id, a.tenant_id, a.allocated_credits, a.used_credits, a.expires_at
            FROM seasonal_credit_allocations a
            WHERE a.is_active = true AND a.is_expired = false
              AND a.expires_at > NOW() AND a.expires_at <= $1
              AND a.allocated_credits > a.used_credits
            "#,
        )
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;

        let mut enqueued = 0;
        for (allocation_id, tenant_id, allocated, used, expires_at) in expiring {
            self.notifications
                .enqueue(
                    tenant_id,
                    "seasonal_credits_expiring",
                    serde_json::json!({
                        "allocation_id": allocation_id,
                        "unused_credits": (allocated - used).to_string(),
                        "expires_at": expires_at.to_string(),
                    }),
                )
                .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_input() -> CreateCampaignInput {
        CreateCampaignInput {
            name: "Winter credits".to_string(),
            credit_type: "promotional".to_string(),
            total_credits: dec!(1000),
            credits_per_tenant: None,
            distribution_method: "equal".to_string(),
            allocation_mode: "shared".to_string(),
            target_tenant_ids: None,
            target_applications: vec![],
            expires_at: OffsetDateTime::now_utc() + time::Duration::days(30),
        }
    }

    #[test]
    fn equal_method_divides_total_across_targets() {
        assert_eq!(tenant_share(None, "equal", dec!(1000), 4), dec!(250));
        assert_eq!(tenant_share(None, "equal", dec!(1000), 3), dec!(333.33));
    }

    #[test]
    fn flat_method_grants_total_to_each() {
        assert_eq!(tenant_share(None, "flat", dec!(1000), 4), dec!(1000));
    }

    #[test]
    fn credits_per_tenant_overrides_method() {
        assert_eq!(tenant_share(Some(dec!(75)), "equal", dec!(1000), 4), dec!(75));
    }

    #[test]
    fn application_split_sums_exactly() {
        let apps: Vec<String> = vec!["reports".into(), "exports".into(), "analytics".into()];
        let rows = split_across_applications(dec!(100), &apps);
        assert_eq!(rows.len(), 3);
        let total: Decimal = rows.iter().map(|(_, p)| *p).sum();
        assert_eq!(total, dec!(100));
        // 33.33 + 33.33 + 33.34
        assert_eq!(rows[0].1, dec!(33.33));
        assert_eq!(rows[2].1, dec!(33.34));
    }

    #[test]
    fn clawback_clamps_at_balance() {
        // allocated 500, used 120, balance 300: unused is 380 but only
        // 300 can be clawed back.
        assert_eq!(clawback_amount(dec!(500), dec!(120), dec!(300)), dec!(300));
        assert_eq!(clawback_amount(dec!(500), dec!(120), dec!(500)), dec!(380));
        assert_eq!(clawback_amount(dec!(500), dec!(500), dec!(300)), dec!(0));
        // Fully-used allocations and negative edge cases debit nothing.
        assert_eq!(clawback_amount(dec!(100), dec!(150), dec!(300)), dec!(0));
        assert_eq!(clawback_amount(dec!(100), dec!(0), dec!(-5)), dec!(0));
    }

    #[test]
    fn pending_campaign_is_claimable() {
        let now = OffsetDateTime::now_utc();
        assert!(distribution_claimable("pending", None, now));
    }

    #[test]
    fn fresh_processing_campaign_is_not_claimable() {
        let now = OffsetDateTime::now_utc();
        let started = Some(now - time::Duration::minutes(5));
        assert!(!distribution_claimable("processing", started, now));
    }

    #[test]
    fn interrupted_processing_campaign_is_claimable_after_timeout() {
        // A run that crashed mid-batch must be resumable; without this
        // the campaign would sit in 'processing' forever.
        let now = OffsetDateTime::now_utc();
        let started = Some(now - time::Duration::minutes(31));
        assert!(distribution_claimable("processing", started, now));
        assert!(distribution_claimable("processing", None, now));
    }

    #[test]
    fn finished_campaigns_are_never_claimable() {
        let now = OffsetDateTime::now_utc();
        let old = Some(now - time::Duration::days(3));
        for status in ["completed", "partial_success", "failed"] {
            assert!(!distribution_claimable(status, old, now));
        }
    }

    #[test]
    fn final_status_from_counts() {
        assert_eq!(
            DistributionStatus::from_counts(4, 0),
            DistributionStatus::Completed
        );
        assert_eq!(
            DistributionStatus::from_counts(3, 1),
            DistributionStatus::PartialSuccess
        );
        assert_eq!(
            DistributionStatus::from_counts(0, 4),
            DistributionStatus::Failed
        );
    }

    #[test]
    fn validation_rejects_bad_inputs() {
        let mut input = base_input();
        input.name = "  ".to_string();
        assert!(matches!(
            input.validate(),
            Err(LedgerError::Validation(_))
        ));

        let mut input = base_input();
        input.total_credits = dec!(0);
        assert!(input.validate().is_err());

        let mut input = base_input();
        input.distribution_method = "raffle".to_string();
        assert!(input.validate().is_err());

        let mut input = base_input();
        input.allocation_mode = "application_specific".to_string();
        input.target_applications = vec![];
        assert!(input.validate().is_err());

        let mut input = base_input();
        input.expires_at = OffsetDateTime::now_utc() - time::Duration::days(1);
        assert!(input.validate().is_err());

        let mut input = base_input();
        input.target_tenant_ids = Some(vec![]);
        assert!(input.validate().is_err());
    }

    #[test]
    fn valid_input_passes() {
        assert!(base_input().validate().is_ok());
    }
}
