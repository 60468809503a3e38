//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use tally_ledger::LedgerService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub ledger: Arc<LedgerService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, ledger: LedgerService) -> Self {
        Self {
            pool,
            config,
            ledger: Arc::new(ledger),
        }
    }
}
