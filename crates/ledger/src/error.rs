//! Error types for the ledger crate.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by ledger operations.
///
/// The taxonomy deliberately separates "benign, report and move on"
/// conditions (`AlreadyProcessed`) from genuine failures: webhook
/// handlers must never turn a duplicate delivery into a retry storm.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed input, rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(Uuid),

    /// The target entity does not resolve in the entity directory for
    /// that tenant. Callers decide whether to fall back to a default
    /// entity.
    #[error("entity {entity_id} not found for tenant {tenant_id}")]
    EntityNotFound { tenant_id: Uuid, entity_id: Uuid },

    #[error("campaign not found: {0}")]
    CampaignNotFound(Uuid),

    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    /// Duplicate webhook / idempotency hit. Not a failure.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    /// Explicit consumption debit would push the balance negative.
    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits {
        available: Decimal,
        requested: Decimal,
    },

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("gateway misconfigured: {0}")]
    GatewayConfig(String),

    #[error("gateway request failed: {0}")]
    Gateway(String),

    /// The fallback lookup chain was exhausted without finding an
    /// owning subscription. Surfaced for manual intervention, never
    /// silently dropped.
    #[error("reconciliation drift: {0}")]
    ReconciliationDrift(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Whether this error represents a benign duplicate rather than a
    /// real failure. Webhook processing reports these as skipped.
    pub fn is_benign_duplicate(&self) -> bool {
        matches!(self, LedgerError::AlreadyProcessed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn duplicate_is_benign() {
        assert!(LedgerError::AlreadyProcessed("evt_1".into()).is_benign_duplicate());
        assert!(!LedgerError::SignatureInvalid.is_benign_duplicate());
    }

    #[test]
    fn insufficient_credits_message_names_amounts() {
        let err = LedgerError::InsufficientCredits {
            available: dec!(10.50),
            requested: dec!(25),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.50"));
        assert!(msg.contains("25"));
    }
}
