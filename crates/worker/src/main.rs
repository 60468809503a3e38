//! Tally Background Worker
//!
//! Handles scheduled jobs including:
//! - Seasonal credit expiry sweep (daily at 2:00 AM UTC)
//! - Expiry warning notifications (daily at 9:00 AM UTC)
//! - Notification queue drain (every minute)
//! - Health check heartbeat (every 5 minutes)

mod notifier;

use std::sync::Arc;
use std::time::Duration;

use tally_ledger::CampaignService;
use tally_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Days of notice before an allocation expires.
const EXPIRY_WARNING_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Tally Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let campaigns = Arc::new(CampaignService::new(pool.clone()));
    let notifier = Arc::new(notifier::Notifier::from_env(pool.clone()));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry sweep (daily at 2:00 AM UTC)
    // Marks due allocations expired and claws back unused credit.
    let sweep_campaigns = campaigns.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let campaigns = sweep_campaigns.clone();
            Box::pin(async move {
                info!("Running seasonal credit expiry sweep");
                match campaigns.process_expiries().await {
                    Ok(summary) => info!(
                        scanned = summary.scanned,
                        expired = summary.expired,
                        credits_clawed_back = %summary.credits_clawed_back,
                        "Expiry sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry sweep (daily at 2:00 AM UTC)");

    // Job 2: Expiry warnings (daily at 9:00 AM UTC)
    let warn_campaigns = campaigns.clone();
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let campaigns = warn_campaigns.clone();
            Box::pin(async move {
                info!("Enqueueing expiry warnings");
                match campaigns.send_expiry_warnings(EXPIRY_WARNING_DAYS).await {
                    Ok(count) => info!(enqueued = count, "Expiry warnings enqueued"),
                    Err(e) => error!(error = %e, "Expiry warning job failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Expiry warnings (daily at 9:00 AM UTC)");

    // Job 3: Notification queue drain (every minute)
    let drain_notifier = notifier.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let notifier = drain_notifier.clone();
            Box::pin(async move {
                notifier.drain().await;
            })
        })?)
        .await?;
    info!("Scheduled: Notification queue drain (every minute)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Tally Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
