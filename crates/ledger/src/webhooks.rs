//! Webhook event processing.
//!
//! Dispatches normalized gateway events to handlers, enforces
//! idempotency at two layers (event claim + operation codes on the
//! ledger), and reports a structured outcome instead of raising on
//! benign duplicates. Gateways deliver at least once; every handler
//! here is safe to run twice.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditService, TransactionType};
use crate::directory::EntityDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{ActorType, LedgerEventBuilder, LedgerEventLogger};
use crate::gateway::{
    ChargeObject, CheckoutSessionObject, DisputeObject, GatewayClient, GatewayEvent, InvoiceObject,
    NormalizedEvent, PaymentIntentObject, RefundObject, SubscriptionObject,
};
use crate::notify::NotificationQueue;
use crate::subscriptions::{Plan, SubscriptionService};

use tally_shared::PlanTier;

/// Events stuck in `processing` longer than this are considered
/// abandoned by a crashed worker and can be re-claimed.
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Structured result of processing one webhook delivery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookOutcome {
    pub processed: bool,
    pub event_type: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookOutcome {
    fn processed(event_type: &str) -> Self {
        Self {
            processed: true,
            event_type: event_type.to_string(),
            skipped: false,
            reason: None,
        }
    }

    fn skipped(event_type: &str, reason: &str) -> Self {
        Self {
            processed: true,
            event_type: event_type.to_string(),
            skipped: true,
            reason: Some(reason.to_string()),
        }
    }

    fn with_reason(event_type: &str, reason: String) -> Self {
        Self {
            processed: true,
            event_type: event_type.to_string(),
            skipped: false,
            reason: Some(reason),
        }
    }
}

/// Resolution of the owning tenant for a gateway payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantResolution {
    BySubscriptionId,
    ByCustomerOnSubscription,
    ByCustomerOnTenant,
    ByCustomerEmail,
}

/// Decide a payment's post-refund status from the cumulative refunded
/// amount, never a single refund's.
pub fn refund_status(payment_amount: Decimal, refunded_total: Decimal) -> &'static str {
    if refunded_total >= payment_amount {
        "refunded"
    } else {
        "partially_refunded"
    }
}

/// Whether a delivery retry may take over an existing claim row: a
/// prior run that ended in `error`, or a `processing` claim older than
/// the timeout (its worker is presumed crashed).
fn claim_recoverable(
    processing_result: &str,
    processing_started_at: OffsetDateTime,
    now: OffsetDateTime,
) -> bool {
    match processing_result {
        "error" => true,
        "processing" => {
            now - processing_started_at > time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES)
        }
        _ => false,
    }
}

/// Processor for verified gateway events.
#[derive(Clone)]
pub struct WebhookProcessor {
    pool: PgPool,
    gateway: GatewayClient,
    directory: EntityDirectory,
    credits: CreditService,
    subscriptions: SubscriptionService,
    event_logger: LedgerEventLogger,
    notifications: NotificationQueue,
}

impl WebhookProcessor {
    pub fn new(pool: PgPool, gateway: GatewayClient) -> Self {
        let directory = EntityDirectory::new(pool.clone());
        Self {
            credits: CreditService::new(pool.clone(), directory.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            event_logger: LedgerEventLogger::new(pool.clone()),
            notifications: NotificationQueue::new(pool.clone()),
            directory,
            gateway,
            pool,
        }
    }

    /// Verify a raw delivery and process it.
    pub async fn handle_raw(&self, payload: &str, signature: &str) -> LedgerResult<WebhookOutcome> {
        let normalized = self.gateway.verify_webhook(payload, signature)?;
        self.process(normalized).await
    }

    /// Process a normalized event with exactly-once claiming.
    ///
    /// The INSERT...ON CONFLICT claim ensures only one concurrent
    /// delivery of the same gateway event id wins; the losers report
    /// skipped. Claims stuck in `processing` past the timeout and
    /// claims whose run ended in `error` are recoverable, so a gateway
    /// retry of a failed event gets a fresh run.
    pub async fn process(&self, normalized: NormalizedEvent) -> LedgerResult<WebhookOutcome> {
        let event_id = normalized.event_id.clone();
        let event_type = normalized.event.type_name().to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(normalized.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (id, gateway_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (gateway_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event_id)
        .bind(&event_type)
        .bind(event_timestamp)
        .fetch_optional(&self.pool)
        .await?;

        let claimed = match inserted {
            Some(_) => true,
            None => self.try_reclaim(&event_id).await?,
        };

        if !claimed {
            tracing::info!(
                gateway_event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event - already claimed or processed"
            );
            return Ok(WebhookOutcome::skipped(&event_type, "duplicate event"));
        }

        tracing::info!(
            gateway_event_id = %event_id,
            event_type = %event_type,
            "Processing gateway webhook event"
        );

        let result = self.dispatch(&event_id, normalized.event).await;

        let (processing_result, error_message, outcome) = match result {
            Ok(outcome) => {
                let status = if outcome.skipped { "skipped" } else { "success" };
                (status, None, Ok(outcome))
            }
            Err(e) if e.is_benign_duplicate() => (
                "skipped",
                None,
                Ok(WebhookOutcome::skipped(&event_type, &e.to_string())),
            ),
            Err(e) => ("error", Some(e.to_string()), Err(e)),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE gateway_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error_message.as_deref())
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                gateway_event_id = %event_id,
                error = %e,
                "Failed to update webhook claim record; event may appear stuck in 'processing'"
            );
        }

        outcome
    }

    /// Attempt to take over an existing claim row for a retry.
    ///
    /// The takeover is a compare-and-set on the observed state, so two
    /// racing retries cannot both win.
    async fn try_reclaim(&self, event_id: &str) -> LedgerResult<bool> {
        let existing: Option<(String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT processing_result, processing_started_at
            FROM gateway_webhook_events
            WHERE gateway_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((prior_result, started_at)) = existing else {
            return Ok(false);
        };
        if !claim_recoverable(&prior_result, started_at, OffsetDateTime::now_utc()) {
            return Ok(false);
        }

        let reclaimed = sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE gateway_event_id = $1
              AND processing_result = $2
              AND processing_started_at = $3
            "#,
        )
        .bind(event_id)
        .bind(&prior_result)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        let won = reclaimed.rows_affected() > 0;
        if won {
            tracing::info!(
                gateway_event_id = %event_id,
                prior_result = %prior_result,
                "Re-claimed webhook event for retry"
            );
        }
        Ok(won)
    }

    async fn dispatch(&self, event_id: &str, event: GatewayEvent) -> LedgerResult<WebhookOutcome> {
        let event_type = event.type_name().to_string();
        match event {
            GatewayEvent::CheckoutCompleted(session) => {
                self.handle_checkout_completed(event_id, session).await?;
            }
            GatewayEvent::PaymentSucceeded(pi) => {
                self.handle_payment_succeeded(event_id, pi).await?;
            }
            GatewayEvent::InvoicePaymentPaid(invoice) => {
                self.handle_invoice_paid(event_id, invoice).await?;
            }
            GatewayEvent::PaymentFailed(pi) => {
                self.handle_payment_failed(event_id, pi).await?;
            }
            GatewayEvent::SubscriptionCreated(sub) | GatewayEvent::SubscriptionUpdated(sub) => {
                self.handle_subscription_synced(event_id, sub).await?;
            }
            GatewayEvent::SubscriptionDeleted(sub) => {
                self.handle_subscription_deleted(event_id, sub).await?;
            }
            GatewayEvent::ChargeSucceeded(charge) => {
                self.handle_charge_succeeded(charge).await?;
            }
            GatewayEvent::ChargeDisputed(dispute) => {
                self.handle_charge_disputed(event_id, dispute).await?;
            }
            GatewayEvent::RefundCreated(refund) => {
                self.handle_refund_created(event_id, refund).await?;
            }
            GatewayEvent::Unhandled { event_type } => {
                tracing::info!(
                    gateway_event_id = %event_id,
                    event_type = %event_type,
                    "No handler configured for gateway event type"
                );
                return Ok(WebhookOutcome::with_reason(
                    &event_type,
                    "no handler for event type".to_string(),
                ));
            }
        }

        Ok(WebhookOutcome::processed(&event_type))
    }

    /// Checkout completion: either a one-off credit purchase or a
    /// subscription activation, decided by session metadata.
    async fn handle_checkout_completed(
        &self,
        event_id: &str,
        session: CheckoutSessionObject,
    ) -> LedgerResult<()> {
        let tenant_id = session
            .metadata
            .get("tenant_id")
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                LedgerError::Internal("tenant_id missing from checkout session metadata".to_string())
            })?;

        if session.metadata.get("purchase_type").map(|s| s.as_str()) == Some("credits") {
            return self.allocate_purchased_credits(event_id, tenant_id, &session).await;
        }

        // Subscription activation path.
        let Some(gateway_sub_id) = session.subscription.clone() else {
            tracing::warn!(
                tenant_id = %tenant_id,
                session_id = %session.id,
                "Checkout completed without subscription or credit purchase marker"
            );
            return Ok(());
        };

        let gateway_sub = SubscriptionObject {
            id: gateway_sub_id,
            customer: session.customer.clone(),
            status: "active".to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            metadata: session.metadata.clone(),
        };
        let sub = self
            .subscriptions
            .sync_from_gateway(tenant_id, &gateway_sub)
            .await?;

        // Plan-included credits go to the primary organization. The
        // session id keys idempotency, so a redelivered checkout event
        // cannot double-grant.
        let tier = PlanTier::from_str(&sub.plan_tier).unwrap_or(PlanTier::Starter);
        let plan = Plan::for_tier(tier);
        match self.directory.find_primary_organization(tenant_id).await? {
            Some(org) => {
                let code = format!("plan_credits:{}", session.id);
                self.credits
                    .apply_delta(
                        tenant_id,
                        org.id,
                        plan.included_credits,
                        TransactionType::Purchase,
                        &code,
                        Some(&code),
                    )
                    .await?;
            }
            None => {
                // Payment already went through at the gateway, so this
                // is logged for manual repair rather than retried.
                tracing::error!(
                    tenant_id = %tenant_id,
                    session_id = %session.id,
                    "No primary organization for tenant - plan credits not allocated, manual intervention required"
                );
            }
        }

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "subscription_activated")
                    .data(serde_json::json!({
                        "plan_tier": sub.plan_tier,
                        "session_id": session.id,
                        "included_credits": plan.included_credits.to_string(),
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    async fn allocate_purchased_credits(
        &self,
        event_id: &str,
        tenant_id: Uuid,
        session: &CheckoutSessionObject,
    ) -> LedgerResult<()> {
        let amount = session
            .metadata
            .get("credit_amount")
            .and_then(|s| s.parse::<Decimal>().ok())
            .or(session.amount_total)
            .ok_or_else(|| {
                LedgerError::Validation("credit purchase without an amount".to_string())
            })?;

        // Explicit entity target wins; otherwise the primary org.
        let entity_id = match session
            .metadata
            .get("entity_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            Some(id) => id,
            None => self
                .directory
                .find_primary_organization(tenant_id)
                .await?
                .map(|e| e.id)
                .ok_or_else(|| {
                    LedgerError::ReconciliationDrift(format!(
                        "credit purchase for tenant {} with no primary organization",
                        tenant_id
                    ))
                })?,
        };

        let code = format!("purchase:{}", session.id);
        let outcome = self
            .credits
            .apply_delta(
                tenant_id,
                entity_id,
                amount,
                TransactionType::Purchase,
                &code,
                Some(&code),
            )
            .await?;

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "credits_purchased")
                    .data(serde_json::json!({
                        "entity_id": entity_id,
                        "amount": amount.to_string(),
                        "new_balance": outcome.new_balance.to_string(),
                        "applied": outcome.applied,
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    async fn handle_payment_succeeded(
        &self,
        event_id: &str,
        pi: PaymentIntentObject,
    ) -> LedgerResult<()> {
        let (tenant_id, resolution) = self
            .resolve_owning_tenant(pi.subscription.as_deref(), pi.customer.as_deref())
            .await?;

        self.upsert_payment(
            tenant_id,
            &pi.id,
            pi.latest_charge.as_deref(),
            "succeeded",
            pi.amount,
            &pi.currency,
        )
        .await?;

        // A succeeding payment recovers a past_due subscription.
        if let Some(sub_id) = pi.subscription.as_deref() {
            sqlx::query(
                r#"
                UPDATE subscriptions SET status = 'active', updated_at = NOW()
                WHERE gateway_subscription_id = $1 AND status = 'past_due'
                "#,
            )
            .bind(sub_id)
            .execute(&self.pool)
            .await?;
        }

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "payment_succeeded")
                    .data(serde_json::json!({
                        "payment_intent_id": pi.id,
                        "amount": pi.amount.to_string(),
                        "resolved_via": format!("{:?}", resolution),
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    async fn handle_invoice_paid(&self, event_id: &str, invoice: InvoiceObject) -> LedgerResult<()> {
        let (tenant_id, resolution) = self
            .resolve_owning_tenant(invoice.subscription.as_deref(), invoice.customer.as_deref())
            .await?;

        // Invoices without a payment intent (e.g. zero-amount period
        // starts) are keyed by the invoice id so redelivery still
        // lands on one row.
        let intent_key = invoice
            .payment_intent
            .clone()
            .unwrap_or_else(|| format!("invoice:{}", invoice.id));
        let amount = invoice.amount_paid.unwrap_or(Decimal::ZERO);
        let currency = invoice.currency.clone().unwrap_or_else(|| "usd".to_string());

        self.upsert_payment(tenant_id, &intent_key, None, "succeeded", amount, &currency)
            .await?;

        // Renewals move the subscription period forward and clear
        // past_due.
        if let Some(sub_id) = invoice.subscription.as_deref() {
            let period_start = invoice
                .period_start
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());
            let period_end = invoice
                .period_end
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'active',
                    current_period_start = COALESCE($2, current_period_start),
                    current_period_end = COALESCE($3, current_period_end),
                    updated_at = NOW()
                WHERE gateway_subscription_id = $1
                "#,
            )
            .bind(sub_id)
            .bind(period_start)
            .bind(period_end)
            .execute(&self.pool)
            .await?;
        }

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "invoice_paid")
                    .data(serde_json::json!({
                        "invoice_id": invoice.id,
                        "amount_paid": amount.to_string(),
                        "resolved_via": format!("{:?}", resolution),
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        event_id: &str,
        pi: PaymentIntentObject,
    ) -> LedgerResult<()> {
        let resolved = self
            .resolve_owning_tenant(pi.subscription.as_deref(), pi.customer.as_deref())
            .await;

        let tenant_id = match resolved {
            Ok((tenant_id, _)) => tenant_id,
            Err(LedgerError::ReconciliationDrift(msg)) => {
                // A failed payment for an unknown tenant needs eyes,
                // but retrying the webhook will not help.
                tracing::error!(
                    payment_intent_id = %pi.id,
                    drift = %msg,
                    "Payment failed for unresolvable tenant"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(sub_id) = pi.subscription.as_deref() {
            self.subscriptions.mark_past_due(sub_id).await?;
        }

        self.upsert_payment(
            tenant_id,
            &pi.id,
            pi.latest_charge.as_deref(),
            "failed",
            pi.amount,
            &pi.currency,
        )
        .await?;

        self.notifications
            .enqueue(
                tenant_id,
                "payment_failed",
                serde_json::json!({
                    "payment_intent_id": pi.id,
                    "amount": pi.amount.to_string(),
                    "currency": pi.currency,
                }),
            )
            .await?;

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "payment_failed")
                    .data(serde_json::json!({
                        "payment_intent_id": pi.id,
                        "amount": pi.amount.to_string(),
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    async fn handle_subscription_synced(
        &self,
        event_id: &str,
        sub: SubscriptionObject,
    ) -> LedgerResult<()> {
        let tenant_id = match sub
            .metadata
            .get("tenant_id")
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            Some(id) => id,
            None => {
                self.resolve_owning_tenant(Some(&sub.id), sub.customer.as_deref())
                    .await?
                    .0
            }
        };

        let synced = self.subscriptions.sync_from_gateway(tenant_id, &sub).await?;

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "subscription_synced")
                    .data(serde_json::json!({
                        "gateway_subscription_id": sub.id,
                        "status": synced.status,
                        "plan_tier": synced.plan_tier,
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    async fn handle_subscription_deleted(
        &self,
        event_id: &str,
        sub: SubscriptionObject,
    ) -> LedgerResult<()> {
        let tenant_id = self.subscriptions.cancel(&sub.id).await?;

        if let Some(tenant_id) = tenant_id {
            self.event_logger
                .log_best_effort(
                    LedgerEventBuilder::new(Some(tenant_id), "subscription_canceled")
                        .data(serde_json::json!({ "gateway_subscription_id": sub.id }))
                        .gateway_event(event_id)
                        .actor_type(ActorType::Gateway),
                )
                .await;
        } else {
            tracing::warn!(
                gateway_subscription_id = %sub.id,
                "Deletion event for unknown subscription"
            );
        }

        Ok(())
    }

    /// Attach the charge id to its payment row for later dispute and
    /// refund lookups. When the gateway reports a cumulative refunded
    /// amount, reconcile the payment status against it.
    async fn handle_charge_succeeded(&self, charge: ChargeObject) -> LedgerResult<()> {
        if let Some(intent_id) = charge.payment_intent.as_deref() {
            sqlx::query(
                r#"
                UPDATE payments SET charge_id = $1, updated_at = NOW()
                WHERE payment_intent_id = $2 AND charge_id IS NULL
                "#,
            )
            .bind(&charge.id)
            .bind(intent_id)
            .execute(&self.pool)
            .await?;

            if let Some(refunded) = charge.amount_refunded {
                if refunded > Decimal::ZERO {
                    let status = refund_status(charge.amount, refunded);
                    sqlx::query(
                        r#"
                        UPDATE payments SET status = $1, updated_at = NOW()
                        WHERE payment_intent_id = $2
                          AND status IN ('succeeded', 'partially_refunded')
                        "#,
                    )
                    .bind(status)
                    .bind(intent_id)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_charge_disputed(
        &self,
        event_id: &str,
        dispute: DisputeObject,
    ) -> LedgerResult<()> {
        let payment: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE payments SET status = 'disputed', updated_at = NOW()
            WHERE charge_id = $1
            RETURNING id, tenant_id
            "#,
        )
        .bind(&dispute.charge)
        .fetch_optional(&self.pool)
        .await?;

        let Some((payment_id, tenant_id)) = payment else {
            return Err(LedgerError::PaymentNotFound(format!(
                "charge {}",
                dispute.charge
            )));
        };

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "charge_disputed")
                    .data(serde_json::json!({
                        "payment_id": payment_id,
                        "charge_id": dispute.charge,
                        "amount": dispute.amount.to_string(),
                        "reason": dispute.reason,
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    /// Record a refund: update the original payment's status and
    /// append a paired negative-amount payment row for audit.
    async fn handle_refund_created(&self, event_id: &str, refund: RefundObject) -> LedgerResult<()> {
        let payment: Option<(Uuid, Uuid, Decimal, String)> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, amount, currency FROM payments
            WHERE charge_id = $1
            "#,
        )
        .bind(&refund.charge)
        .fetch_optional(&self.pool)
        .await?;

        let Some((payment_id, tenant_id, payment_amount, currency)) = payment else {
            return Err(LedgerError::PaymentNotFound(format!(
                "charge {}",
                refund.charge
            )));
        };

        // The refund row is keyed by the refund id, so redelivery
        // cannot duplicate it. Recorded first: the status decision
        // below sums these rows, so it sees this refund too.
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, tenant_id, payment_intent_id, charge_id, status, amount, currency, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'refunded', $5, $6, $7, NOW(), NOW())
            ON CONFLICT (payment_intent_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(format!("refund:{}", refund.id))
        .bind(&refund.charge)
        .bind(-refund.amount)
        .bind(&currency)
        .bind(format!("Refund for payment {}", payment_id))
        .execute(&self.pool)
        .await?;

        // Partial refunds accumulate: the status compares the sum of
        // every refund against the original amount, so two halves of a
        // payment refunded separately still end in 'refunded'.
        let (refunded_total,): (Decimal,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(-amount), 0)
            FROM payments
            WHERE charge_id = $1 AND payment_intent_id LIKE 'refund:%'
            "#,
        )
        .bind(&refund.charge)
        .fetch_one(&self.pool)
        .await?;

        let status = refund_status(payment_amount, refunded_total);
        sqlx::query("UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(payment_id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        self.event_logger
            .log_best_effort(
                LedgerEventBuilder::new(Some(tenant_id), "refund_recorded")
                    .data(serde_json::json!({
                        "payment_id": payment_id,
                        "refund_id": refund.id,
                        "amount": refund.amount.to_string(),
                        "new_status": status,
                    }))
                    .gateway_event(event_id)
                    .actor_type(ActorType::Gateway),
            )
            .await;

        Ok(())
    }

    /// Resolve the tenant a gateway payment belongs to.
    ///
    /// Ordered fallback chain, mandatory per the reconciliation
    /// contract: subscription id -> customer id on subscriptions ->
    /// customer id on tenants -> customer email against users. Only
    /// when every rung fails is the event surfaced as drift.
    async fn resolve_owning_tenant(
        &self,
        gateway_subscription_id: Option<&str>,
        gateway_customer_id: Option<&str>,
    ) -> LedgerResult<(Uuid, TenantResolution)> {
        if let Some(sub_id) = gateway_subscription_id {
            if let Some(sub) = self
                .subscriptions
                .find_by_gateway_subscription(sub_id)
                .await?
            {
                return Ok((sub.tenant_id, TenantResolution::BySubscriptionId));
            }
        }

        let Some(customer_id) = gateway_customer_id else {
            return Err(LedgerError::ReconciliationDrift(
                "event carries neither a known subscription nor a customer id".to_string(),
            ));
        };

        if let Some(sub) = self
            .subscriptions
            .find_by_gateway_customer(customer_id)
            .await?
        {
            return Ok((sub.tenant_id, TenantResolution::ByCustomerOnSubscription));
        }

        let tenant: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM tenants WHERE gateway_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((tenant_id,)) = tenant {
            return Ok((tenant_id, TenantResolution::ByCustomerOnTenant));
        }

        // Last rung: ask the gateway who the customer is and match by
        // email against local users.
        let customer = self.gateway.retrieve_customer(customer_id).await?;
        if let Some(email) = customer.email.as_deref() {
            let user_tenant: Option<(Uuid,)> =
                sqlx::query_as("SELECT tenant_id FROM users WHERE LOWER(email) = LOWER($1) LIMIT 1")
                    .bind(email)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((tenant_id,)) = user_tenant {
                tracing::warn!(
                    gateway_customer_id = %customer_id,
                    tenant_id = %tenant_id,
                    "Tenant resolved via customer email fallback - local records are behind"
                );
                return Ok((tenant_id, TenantResolution::ByCustomerEmail));
            }
        }

        Err(LedgerError::ReconciliationDrift(format!(
            "no local record matches gateway customer {}",
            customer_id
        )))
    }

    /// Upsert the payment row keyed by the gateway payment-intent id.
    /// Redelivery updates in place instead of duplicating.
    async fn upsert_payment(
        &self,
        tenant_id: Uuid,
        payment_intent_id: &str,
        charge_id: Option<&str>,
        status: &str,
        amount: Decimal,
        currency: &str,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, tenant_id, payment_intent_id, charge_id, status, amount, currency, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (payment_intent_id) DO UPDATE SET
                status = EXCLUDED.status,
                charge_id = COALESCE(EXCLUDED.charge_id, payments.charge_id),
                amount = EXCLUDED.amount,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(payment_intent_id)
        .bind(charge_id)
        .bind(status)
        .bind(amount)
        .bind(currency)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn full_refund_marks_refunded() {
        assert_eq!(refund_status(dec!(49.00), dec!(49.00)), "refunded");
        assert_eq!(refund_status(dec!(49.00), dec!(50.00)), "refunded");
    }

    #[test]
    fn partial_refund_marks_partially_refunded() {
        assert_eq!(refund_status(dec!(49.00), dec!(10.00)), "partially_refunded");
    }

    #[test]
    fn partial_refunds_accumulate_to_refunded() {
        // Two partial refunds covering the full amount between them.
        let first = dec!(20.00);
        let second = dec!(29.00);
        assert_eq!(refund_status(dec!(49.00), first), "partially_refunded");
        assert_eq!(refund_status(dec!(49.00), first + second), "refunded");
    }

    #[test]
    fn errored_claim_is_always_recoverable() {
        let now = OffsetDateTime::now_utc();
        assert!(claim_recoverable("error", now, now));
        assert!(claim_recoverable(
            "error",
            now - time::Duration::seconds(5),
            now
        ));
    }

    #[test]
    fn fresh_processing_claim_is_not_recoverable() {
        let now = OffsetDateTime::now_utc();
        assert!(!claim_recoverable(
            "processing",
            now - time::Duration::minutes(5),
            now
        ));
    }

    #[test]
    fn stale_processing_claim_is_recoverable() {
        let now = OffsetDateTime::now_utc();
        assert!(claim_recoverable(
            "processing",
            now - time::Duration::minutes(31),
            now
        ));
    }

    #[test]
    fn finished_claims_are_not_recoverable() {
        let now = OffsetDateTime::now_utc();
        let old = now - time::Duration::days(2);
        assert!(!claim_recoverable("success", old, now));
        assert!(!claim_recoverable("skipped", old, now));
    }

    #[test]
    fn skipped_outcome_serializes_with_reason() {
        let outcome = WebhookOutcome::skipped("payment_intent.succeeded", "duplicate event");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["processed"], true);
        assert_eq!(json["skipped"], true);
        assert_eq!(json["reason"], "duplicate event");
    }

    #[test]
    fn processed_outcome_omits_skip_fields() {
        let outcome = WebhookOutcome::processed("invoice.payment_succeeded");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["processed"], true);
        assert!(json.get("skipped").is_none());
        assert!(json.get("reason").is_none());
    }
}
