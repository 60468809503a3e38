//! Audit sink: structured ledger events.
//!
//! Every interesting mutation logs a row here. Inserts are best
//! effort: an audit failure is logged and swallowed so it can never
//! fail the mutation it describes.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::LedgerResult;

/// Who caused an event.
#[derive(Debug, Clone, Copy)]
pub enum ActorType {
    Gateway,
    Operator,
    System,
}

impl ActorType {
    fn as_str(&self) -> &'static str {
        match self {
            ActorType::Gateway => "gateway",
            ActorType::Operator => "operator",
            ActorType::System => "system",
        }
    }
}

/// Builder for one audit event.
pub struct LedgerEventBuilder {
    tenant_id: Option<Uuid>,
    event_type: String,
    data: serde_json::Value,
    gateway_event_id: Option<String>,
    actor_type: ActorType,
}

impl LedgerEventBuilder {
    pub fn new(tenant_id: Option<Uuid>, event_type: &str) -> Self {
        Self {
            tenant_id,
            event_type: event_type.to_string(),
            data: serde_json::Value::Null,
            gateway_event_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn gateway_event(mut self, event_id: &str) -> Self {
        self.gateway_event_id = Some(event_id.to_string());
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }
}

/// Writer for the `ledger_events` audit table.
#[derive(Clone)]
pub struct LedgerEventLogger {
    pool: PgPool,
}

impl LedgerEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: LedgerEventBuilder) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_events
                (id, tenant_id, event_type, data, gateway_event_id, actor_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(builder.tenant_id)
        .bind(&builder.event_type)
        .bind(&builder.data)
        .bind(builder.gateway_event_id.as_deref())
        .bind(builder.actor_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Log and swallow failures. The common call form in handlers.
    pub async fn log_best_effort(&self, builder: LedgerEventBuilder) {
        let event_type = builder.event_type.clone();
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(event_type = %event_type, error = %e, "Failed to write audit event");
        }
    }
}
