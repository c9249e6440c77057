use crate::queue::JobQueue;
use crate::sources::SourceRegistry;
use crate::store::CatalogStore;
use anyhow::{Context, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Jobs created and enqueued, in product order.
    pub job_ids: Vec<Uuid>,
}

impl RefreshSummary {
    pub fn queued(&self) -> usize {
        self.job_ids.len()
    }
}

/// Creates a pending job for every product and enqueues it. A product whose
/// job cannot be created or enqueued is logged and skipped.
#[instrument(name = "refresh_all", skip_all)]
pub async fn refresh_all(
    store: &dyn CatalogStore,
    queue: &dyn JobQueue,
) -> Result<RefreshSummary, Error> {
    let products = store
        .list_products()
        .await
        .context("failed to list products")?;

    let mut summary = RefreshSummary::default();
    for product in products {
        let job = match store.create_fetch_job(&product.id).await {
            Ok(job) => job,
            Err(err) => {
                error!(message = "Failed to create fetch job", product_id = %product.id, error = ?err);
                continue;
            }
        };

        if let Err(err) = queue.enqueue(job.id).await {
            error!(message = "Failed to enqueue fetch job", product_id = %product.id, job_id = %job.id, error = ?err);
            continue;
        }

        debug!(message = "Queued fetch job", product_id = %product.id, job_id = %job.id);
        summary.job_ids.push(job.id);
    }

    info!(message = "Refresh queued", jobs = summary.queued());
    Ok(summary)
}

/// Writes the descriptor of every registered source to the catalog.
/// Returns the number of products written.
#[instrument(name = "sync_catalog", skip_all)]
pub async fn sync_catalog(store: &dyn CatalogStore, sources: &SourceRegistry) -> usize {
    let mut synced = 0;
    for descriptor in sources.descriptors() {
        match store.upsert_product(descriptor).await {
            Ok(()) => synced += 1,
            Err(err) => {
                error!(message = "Failed to sync product", product_id = descriptor.id, error = ?err);
            }
        }
    }
    info!(message = "Catalog synced", products = synced);
    synced
}

/// Calls [`refresh_all`] every `period`, first one period after start.
pub async fn run_scheduler(
    store: Arc<dyn CatalogStore>,
    queue: Arc<dyn JobQueue>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Scheduler cancelled");
                break;
            },
            _ = ticker.tick() => {
                match refresh_all(store.as_ref(), queue.as_ref()).await {
                    Ok(summary) => info!(message = "Scheduled refresh", jobs = summary.queued()),
                    Err(err) => error!(message = "Scheduled refresh failed", error = ?err),
                }
            }
        }
    }
    info!("Scheduler stopped.");
}
