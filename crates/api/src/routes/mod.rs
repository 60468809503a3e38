//! Route tree.

pub mod campaigns;
pub mod consistency;
pub mod credits;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gateway", post(webhooks::receive_gateway_webhook))
        .route(
            "/tenants/{tenant_id}/entities/{entity_id}/balance",
            get(credits::get_balance),
        )
        .route(
            "/tenants/{tenant_id}/credits/allocate",
            post(credits::bulk_allocate),
        )
        .route(
            "/tenants/{tenant_id}/transactions",
            get(credits::list_transactions),
        )
        .route(
            "/campaigns",
            get(campaigns::list_campaigns).post(campaigns::create_campaign),
        )
        .route("/campaigns/expiry-sweep", post(campaigns::expiry_sweep))
        .route("/campaigns/{id}", get(campaigns::get_campaign))
        .route("/campaigns/{id}/distribute", post(campaigns::distribute))
        .route("/campaigns/{id}/status", get(campaigns::distribution_status))
        .route(
            "/campaigns/{id}/allocations",
            get(campaigns::list_allocations),
        )
        .route("/campaigns/{id}/extend", post(campaigns::extend_expiry))
        .route(
            "/campaigns/{id}/notify-expiry",
            post(campaigns::notify_expiry),
        )
        .route(
            "/tenants/{tenant_id}/consistency/orphans",
            get(consistency::detect_orphans),
        )
        .route(
            "/tenants/{tenant_id}/consistency/orphans/clean",
            post(consistency::clean_orphans),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
