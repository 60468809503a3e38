//! Shared types and database plumbing for the tally workspace.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{EntityKind, PlanTier};
