//! Notification queue drain.
//!
//! Claims queued notifications in batches and delivers them to the
//! configured outbound webhook. Without a configured URL, rows are
//! marked sent after logging so the queue never grows unbounded in
//! development environments.

use tally_ledger::NotificationQueue;
use tracing::{error, info, warn};

const BATCH_SIZE: i64 = 50;

#[derive(Clone)]
pub struct Notifier {
    queue: NotificationQueue,
    http: reqwest::Client,
    delivery_url: Option<String>,
}

impl Notifier {
    pub fn new(queue: NotificationQueue, delivery_url: Option<String>) -> Self {
        Self {
            queue,
            http: reqwest::Client::new(),
            delivery_url,
        }
    }

    pub fn from_env(pool: sqlx::PgPool) -> Self {
        let delivery_url = std::env::var("NOTIFY_WEBHOOK_URL").ok();
        if delivery_url.is_none() {
            warn!("NOTIFY_WEBHOOK_URL not set - notifications will be logged and marked sent");
        }
        Self::new(NotificationQueue::new(pool), delivery_url)
    }

    /// Drain one batch. Called on a schedule; each notification either
    /// gets marked sent or requeued with its attempt count bumped.
    pub async fn drain(&self) {
        let batch = match self.queue.claim_batch(BATCH_SIZE).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Failed to claim notification batch");
                return;
            }
        };

        if batch.is_empty() {
            return;
        }

        info!(count = batch.len(), "Draining notification queue");

        for notification in batch {
            let delivered = match &self.delivery_url {
                Some(url) => {
                    let body = serde_json::json!({
                        "id": notification.id,
                        "tenant_id": notification.tenant_id,
                        "kind": notification.kind,
                        "payload": notification.payload,
                    });
                    match self.http.post(url).json(&body).send().await {
                        Ok(response) if response.status().is_success() => true,
                        Ok(response) => {
                            warn!(
                                notification_id = %notification.id,
                                status = %response.status(),
                                "Notification delivery rejected"
                            );
                            false
                        }
                        Err(e) => {
                            warn!(
                                notification_id = %notification.id,
                                error = %e,
                                "Notification delivery failed"
                            );
                            false
                        }
                    }
                }
                None => {
                    info!(
                        notification_id = %notification.id,
                        tenant_id = %notification.tenant_id,
                        kind = %notification.kind,
                        "Notification (no delivery URL configured)"
                    );
                    true
                }
            };

            let result = if delivered {
                self.queue.mark_sent(notification.id).await
            } else {
                self.queue
                    .mark_failed(notification.id, notification.attempts)
                    .await
            };

            if let Err(e) = result {
                error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to update notification status"
                );
            }
        }
    }
}
