// Ledger crate clippy configuration
#![allow(clippy::result_large_err)] // LedgerError carries decimal context on some variants
#![allow(clippy::too_many_arguments)] // Ledger mutations carry full audit context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tally Ledger Module
//!
//! Core of the credit ledger: balances, the immutable transaction
//! chain, gateway webhook reconciliation, subscriptions, seasonal
//! campaigns, and the consistency auditor.
//!
//! ## Features
//!
//! - **Credit Ledger**: Atomic balance deltas with an append-only transaction chain
//! - **Entity Directory**: Tenant-scoped entity hierarchy with cycle-safe traversal
//! - **Gateway Adapter**: Signature verification and normalized event types
//! - **Webhook Processing**: Idempotent event handling with structured outcomes
//! - **Subscriptions**: Trial/active/past_due/canceled lifecycle with entitlements
//! - **Seasonal Campaigns**: Bulk credit distribution and expiry clawback
//! - **Consistency Auditing**: Orphan detection and chain verification

pub mod auditor;
pub mod campaigns;
pub mod credits;
pub mod directory;
pub mod error;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Auditor
pub use auditor::{ChainReport, CleanupReport, ConsistencyAuditor, OrphanedCredit};

// Campaigns
pub use campaigns::{
    CampaignService, CreateCampaignInput, DistributionStatus, DistributionSummary,
    ExpirySweepSummary, SeasonalCampaign, SeasonalCreditAllocation,
};

// Credits
pub use credits::{
    chain_violations, BulkAllocationOutcome, ChainViolation, Credit, CreditService,
    CreditTransaction, DeltaOutcome, EntityAllocation, TransactionFilter, TransactionPage,
    TransactionType,
};

// Directory
pub use directory::{Entity, EntityDirectory, MAX_HIERARCHY_DEPTH};

// Error
pub use error::{LedgerError, LedgerResult};

// Events
pub use events::{ActorType, LedgerEventBuilder, LedgerEventLogger};

// Gateway
pub use gateway::{GatewayClient, GatewayConfig, GatewayEvent, NormalizedEvent};

// Notifications
pub use notify::{NotificationQueue, QueuedNotification};

// Subscriptions
pub use subscriptions::{Plan, Subscription, SubscriptionService, SubscriptionStatus};

// Webhooks
pub use webhooks::{WebhookOutcome, WebhookProcessor};

use sqlx::PgPool;

/// Main ledger service that combines all ledger functionality
pub struct LedgerService {
    pub credits: CreditService,
    pub directory: EntityDirectory,
    pub subscriptions: SubscriptionService,
    pub campaigns: CampaignService,
    pub auditor: ConsistencyAuditor,
    pub webhooks: WebhookProcessor,
    pub notifications: NotificationQueue,
    pub events: LedgerEventLogger,
}

impl LedgerService {
    /// Create a new ledger service from environment variables
    pub fn from_env(pool: PgPool) -> LedgerResult<Self> {
        let gateway = GatewayClient::from_env()?;
        Ok(Self::new(gateway, pool))
    }

    /// Create a new ledger service with an explicit gateway client
    pub fn new(gateway: GatewayClient, pool: PgPool) -> Self {
        let directory = EntityDirectory::new(pool.clone());

        Self {
            credits: CreditService::new(pool.clone(), directory.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            campaigns: CampaignService::new(pool.clone()),
            auditor: ConsistencyAuditor::new(pool.clone()),
            webhooks: WebhookProcessor::new(pool.clone(), gateway),
            notifications: NotificationQueue::new(pool.clone()),
            events: LedgerEventLogger::new(pool),
            directory,
        }
    }
}
