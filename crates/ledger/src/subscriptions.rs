//! Subscription state machine and plan entitlements.
//!
//! Tracks plan/status per tenant and applies entitlement side effects
//! (role grants, application access) when a tenant lands on a plan.
//! Entitlement application is idempotent so that replaying the same
//! webhook after a crash converges to the same state.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tally_shared::PlanTier;

use crate::error::{LedgerError, LedgerResult};
use crate::gateway::SubscriptionObject;

/// Local subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "trial" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Map the gateway's status vocabulary onto ours.
    pub fn from_gateway(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Legal transitions: trial -> active -> past_due -> (active |
    /// canceled), plus direct active -> canceled (user cancellation).
    /// Self-transitions are allowed; webhook replays re-assert state.
    pub fn can_transition(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (Trial, Active)
                | (Trial, Canceled)
                | (Active, PastDue)
                | (Active, Canceled)
                | (PastDue, Active)
                | (PastDue, Canceled)
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static plan catalog: credits and entitlements per tier.
#[derive(Debug, Clone)]
pub struct Plan {
    pub tier: PlanTier,
    pub included_credits: Decimal,
    pub subscribed_tools: &'static [&'static str],
    pub admin_permissions: &'static [&'static str],
    pub monthly_request_limit: i64,
}

impl Plan {
    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Starter => Plan {
                tier,
                included_credits: Decimal::from(500),
                subscribed_tools: &["reports", "exports"],
                admin_permissions: &["credits.read", "reports.run"],
                monthly_request_limit: 10_000,
            },
            PlanTier::Growth => Plan {
                tier,
                included_credits: Decimal::from(2_500),
                subscribed_tools: &["reports", "exports", "integrations", "scheduling"],
                admin_permissions: &[
                    "credits.read",
                    "credits.allocate",
                    "reports.run",
                    "integrations.manage",
                ],
                monthly_request_limit: 100_000,
            },
            PlanTier::Scale => Plan {
                tier,
                included_credits: Decimal::from(10_000),
                subscribed_tools: &[
                    "reports",
                    "exports",
                    "integrations",
                    "scheduling",
                    "analytics",
                    "api_access",
                ],
                admin_permissions: &[
                    "credits.read",
                    "credits.allocate",
                    "reports.run",
                    "integrations.manage",
                    "analytics.read",
                    "api.manage",
                ],
                monthly_request_limit: 1_000_000,
            },
        }
    }
}

/// Per-tenant subscription row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_tier: String,
    pub status: String,
    pub billing_cycle: String,
    pub gateway_customer_id: Option<String>,
    pub gateway_subscription_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::from_str(&self.status)
    }
}

/// Service over the `subscriptions` table and entitlement side
/// effects.
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_for_tenant(&self, tenant_id: Uuid) -> LedgerResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_tier, status, billing_cycle,
                   gateway_customer_id, gateway_subscription_id,
                   current_period_start, current_period_end, updated_at
            FROM subscriptions
            WHERE tenant_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    pub async fn find_by_gateway_subscription(
        &self,
        gateway_subscription_id: &str,
    ) -> LedgerResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_tier, status, billing_cycle,
                   gateway_customer_id, gateway_subscription_id,
                   current_period_start, current_period_end, updated_at
            FROM subscriptions
            WHERE gateway_subscription_id = $1
            "#,
        )
        .bind(gateway_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    pub async fn find_by_gateway_customer(
        &self,
        gateway_customer_id: &str,
    ) -> LedgerResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_tier, status, billing_cycle,
                   gateway_customer_id, gateway_subscription_id,
                   current_period_start, current_period_end, updated_at
            FROM subscriptions
            WHERE gateway_customer_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(gateway_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// Upsert the local subscription row from a gateway payload and
    /// apply entitlement side effects for transitions into `active`.
    ///
    /// Safe to replay: the upsert converges and entitlement writes are
    /// idempotent.
    pub async fn sync_from_gateway(
        &self,
        tenant_id: Uuid,
        gateway_sub: &SubscriptionObject,
    ) -> LedgerResult<Subscription> {
        let status = SubscriptionStatus::from_gateway(&gateway_sub.status).ok_or_else(|| {
            LedgerError::Validation(format!(
                "unknown gateway subscription status '{}'",
                gateway_sub.status
            ))
        })?;

        if let Some(existing) = self.get_for_tenant(tenant_id).await? {
            if let Some(current) = existing.status() {
                if !current.can_transition(status) {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        from = %current,
                        to = %status,
                        "Out-of-order subscription transition from gateway, applying anyway"
                    );
                }
            }
        }

        let tier = gateway_sub
            .plan_tier()
            .and_then(PlanTier::from_str)
            .unwrap_or(PlanTier::Starter);
        let billing_cycle = gateway_sub
            .metadata
            .get("billing_cycle")
            .cloned()
            .unwrap_or_else(|| "monthly".to_string());

        let period_start = gateway_sub
            .current_period_start
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());
        let period_end = gateway_sub
            .current_period_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

        let sub: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (id, tenant_id, plan_tier, status, billing_cycle,
                 gateway_customer_id, gateway_subscription_id,
                 current_period_start, current_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (tenant_id) DO UPDATE SET
                plan_tier = EXCLUDED.plan_tier,
                status = EXCLUDED.status,
                billing_cycle = EXCLUDED.billing_cycle,
                gateway_customer_id = EXCLUDED.gateway_customer_id,
                gateway_subscription_id = EXCLUDED.gateway_subscription_id,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = NOW()
            RETURNING id, tenant_id, plan_tier, status, billing_cycle,
                      gateway_customer_id, gateway_subscription_id,
                      current_period_start, current_period_end, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(tier.as_str())
        .bind(status.as_str())
        .bind(&billing_cycle)
        .bind(gateway_sub.customer.as_deref())
        .bind(&gateway_sub.id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        if status == SubscriptionStatus::Active {
            self.apply_entitlements(tenant_id, tier).await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            gateway_subscription_id = %gateway_sub.id,
            status = %status,
            plan_tier = %tier,
            "Subscription synced from gateway"
        );

        Ok(sub)
    }

    /// Grant the plan's role permissions and application access.
    ///
    /// Runs in the same logical operation as the subscription update;
    /// every write is an upsert so a crash between the two is repaired
    /// by replaying the webhook.
    pub async fn apply_entitlements(&self, tenant_id: Uuid, tier: PlanTier) -> LedgerResult<()> {
        let plan = Plan::for_tier(tier);

        sqlx::query(
            r#"
            INSERT INTO role_grants (tenant_id, role, permissions, updated_at)
            VALUES ($1, 'administrator', $2, NOW())
            ON CONFLICT (tenant_id, role) DO UPDATE SET
                permissions = EXCLUDED.permissions,
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(
            plan.admin_permissions
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>(),
        )
        .execute(&self.pool)
        .await?;

        // Disable everything first, then enable the plan's tools, so a
        // downgrade revokes access the previous plan granted.
        sqlx::query(
            "UPDATE application_entitlements SET enabled = false, updated_at = NOW() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        for tool in plan.subscribed_tools {
            sqlx::query(
                r#"
                INSERT INTO application_entitlements (tenant_id, application, enabled, plan_tier, updated_at)
                VALUES ($1, $2, true, $3, NOW())
                ON CONFLICT (tenant_id, application) DO UPDATE SET
                    enabled = true,
                    plan_tier = EXCLUDED.plan_tier,
                    updated_at = NOW()
                "#,
            )
            .bind(tenant_id)
            .bind(tool)
            .bind(tier.as_str())
            .execute(&self.pool)
            .await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            plan_tier = %tier,
            tools = plan.subscribed_tools.len(),
            "Entitlements applied for plan"
        );

        Ok(())
    }

    /// Revoke all application access, keeping the rows for audit.
    pub async fn revoke_entitlements(&self, tenant_id: Uuid) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE application_entitlements SET enabled = false, updated_at = NOW() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_past_due(&self, gateway_subscription_id: &str) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'past_due', updated_at = NOW()
            WHERE gateway_subscription_id = $1
            "#,
        )
        .bind(gateway_subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a subscription canceled and revoke entitlements.
    pub async fn cancel(&self, gateway_subscription_id: &str) -> LedgerResult<Option<Uuid>> {
        let tenant: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions SET status = 'canceled', updated_at = NOW()
            WHERE gateway_subscription_id = $1
            RETURNING tenant_id
            "#,
        )
        .bind(gateway_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((tenant_id,)) = tenant {
            self.revoke_entitlements(tenant_id).await?;
            tracing::info!(
                tenant_id = %tenant_id,
                gateway_subscription_id = %gateway_subscription_id,
                "Subscription canceled, entitlements revoked"
            );
            return Ok(Some(tenant_id));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn transition_matrix() {
        assert!(Trial.can_transition(Active));
        assert!(Trial.can_transition(Canceled));
        assert!(Active.can_transition(PastDue));
        assert!(Active.can_transition(Canceled));
        assert!(PastDue.can_transition(Active));
        assert!(PastDue.can_transition(Canceled));

        assert!(!Canceled.can_transition(Active));
        assert!(!Canceled.can_transition(PastDue));
        assert!(!PastDue.can_transition(Trial));
        assert!(!Active.can_transition(Trial));
    }

    #[test]
    fn replay_self_transition_is_legal() {
        for status in [Trial, Active, PastDue, Canceled] {
            assert!(status.can_transition(status));
        }
    }

    #[test]
    fn gateway_status_mapping() {
        assert_eq!(SubscriptionStatus::from_gateway("trialing"), Some(Trial));
        assert_eq!(SubscriptionStatus::from_gateway("active"), Some(Active));
        assert_eq!(SubscriptionStatus::from_gateway("past_due"), Some(PastDue));
        assert_eq!(SubscriptionStatus::from_gateway("unpaid"), Some(PastDue));
        assert_eq!(SubscriptionStatus::from_gateway("canceled"), Some(Canceled));
        assert_eq!(SubscriptionStatus::from_gateway("paused"), None);
    }

    #[test]
    fn plan_catalog_grows_with_tier() {
        let starter = Plan::for_tier(PlanTier::Starter);
        let growth = Plan::for_tier(PlanTier::Growth);
        let scale = Plan::for_tier(PlanTier::Scale);

        assert!(starter.included_credits < growth.included_credits);
        assert!(growth.included_credits < scale.included_credits);
        assert!(starter.subscribed_tools.len() < scale.subscribed_tools.len());

        // Every lower tier's tools are included in the next tier up.
        for tool in starter.subscribed_tools {
            assert!(growth.subscribed_tools.contains(tool));
        }
        for tool in growth.subscribed_tools {
            assert!(scale.subscribed_tools.contains(tool));
        }
    }
}
