use crate::metrics::MetricsSink;
use crate::queue::{JobMessage, JobQueue, RetryDecision};
use crate::sources::{FetchContext, Source, SourceError, SourceRegistry};
use crate::store::CatalogStore;
use crate::{JobStatus, ProductVersion, VersionRecord};
use anyhow::{Context, Error};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// How long one dequeue blocks before the cancellation signal is checked again.
    pub dequeue_timeout: Duration,
    /// Upper bound on a single source fetch.
    pub fetch_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            dequeue_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of one delivery, before the envelope is acknowledged or retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { versions: usize },
    Failed(String),
}

#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn CatalogStore>,
    queue: Arc<dyn JobQueue>,
    sources: Arc<SourceRegistry>,
    metrics: Arc<dyn MetricsSink>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        queue: Arc<dyn JobQueue>,
        sources: Arc<SourceRegistry>,
        metrics: Arc<dyn MetricsSink>,
        settings: WorkerSettings,
    ) -> Self {
        Worker {
            store,
            queue,
            sources,
            metrics,
            settings,
        }
    }

    /// Pulls and handles envelopes until `cancel_token` fires. A job in
    /// progress is finished before the signal is observed.
    pub async fn start(self, cancel_token: CancellationToken) {
        loop {
            if cancel_token.is_cancelled() {
                debug!("Worker cancelled");
                break;
            }

            let message = match self.queue.dequeue(self.settings.dequeue_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) => {
                    error!(message = "Error dequeuing job", error = ?err);
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = sleep(DEQUEUE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let job_id = message.id;
            if let Err(err) = self.handle(message).await {
                // Neither retried nor acknowledged: the id stays in the processing set.
                error!(message = "Job handling failed, envelope dropped", job_id = %job_id, error = ?err);
                self.metrics.job_finished(JobStatus::Failed);
            }
        }
        info!("Worker stopped.");
    }

    /// Runs one delivery and settles its envelope. Errors are job-status or
    /// queue transport failures; a failed fetch is `Ok(Outcome::Failed)`.
    #[instrument(skip_all, fields(job_id = %message.id, retries = message.retries))]
    pub async fn handle(&self, message: JobMessage) -> Result<Outcome, Error> {
        let outcome = self.run_job(message.id).await?;

        match &outcome {
            Outcome::Completed { versions } => {
                self.queue
                    .mark_completed(message.id)
                    .await
                    .context("failed to acknowledge job")?;
                info!(message = "Job completed", versions);
                self.metrics.job_finished(JobStatus::Completed);
            }
            Outcome::Failed(reason) => {
                match self
                    .queue
                    .retry_job(message)
                    .await
                    .context("failed to retry job")?
                {
                    RetryDecision::Requeued { retries } => {
                        warn!(message = "Job failed, requeued", error = %reason, retries);
                    }
                    RetryDecision::Dropped { retries } => {
                        warn!(message = "Job failed, retry budget spent", error = %reason, retries);
                    }
                }
                self.metrics.job_finished(JobStatus::Failed);
            }
        }

        Ok(outcome)
    }

    async fn run_job(&self, job_id: Uuid) -> Result<Outcome, Error> {
        self.store
            .begin_job(job_id)
            .await
            .context("failed to mark job running")?;

        let job = match self.store.get_fetch_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return self.fail(job_id, format!("fetch job {job_id} not found")).await,
            Err(err) => return self.fail(job_id, format!("failed to load job: {err:#}")).await,
        };

        match self.store.get_product(&job.product_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let reason = format!("product {} not found", job.product_id);
                return self.fail(job_id, reason).await;
            }
            Err(err) => {
                let reason = format!("failed to load product {}: {err:#}", job.product_id);
                return self.fail(job_id, reason).await;
            }
        }

        let Some(source) = self.sources.get(&job.product_id) else {
            let reason = format!("no fetcher for product {}", job.product_id);
            return self.fail(job_id, reason).await;
        };

        debug!(message = "Fetching", product_id = %job.product_id);
        let records = match self.fetch(source.as_ref()).await {
            Ok(records) => records,
            Err(err) => return self.fail(job_id, err.to_string()).await,
        };

        let versions = records.len();
        self.save(&job.product_id, records).await;

        if let Err(err) = self.store.promote_latest(&job.product_id).await {
            error!(message = "Failed to promote latest versions", product_id = %job.product_id, error = ?err);
        }

        self.store
            .complete_job(job_id)
            .await
            .context("failed to mark job completed")?;
        self.metrics.product_versions(&job.product_id, versions);

        Ok(Outcome::Completed { versions })
    }

    async fn fetch(&self, source: &dyn Source) -> Result<Vec<VersionRecord>, SourceError> {
        let cancel = CancellationToken::new();
        let cx = FetchContext::new(cancel.clone());
        let budget = self.settings.fetch_timeout;

        match tokio::time::timeout(budget, source.fetch(&cx)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(SourceError::TimedOut(budget))
            }
        }
    }

    /// Upserts every record; a row that cannot be saved is logged and skipped.
    async fn save(&self, product_id: &str, records: Vec<VersionRecord>) {
        for record in records {
            let row = ProductVersion::from_record(product_id, record, Utc::now());
            if let Err(err) = self.store.upsert_version(&row).await {
                warn!(
                    message = "Failed to save version",
                    version = %row.version,
                    platform = %row.platform,
                    architecture = %row.architecture,
                    error = ?err
                );
            }
        }
    }

    async fn fail(&self, job_id: Uuid, reason: String) -> Result<Outcome, Error> {
        self.store
            .fail_job(job_id, &reason)
            .await
            .context("failed to mark job failed")?;
        Ok(Outcome::Failed(reason))
    }
}
