use crate::metrics::MetricsSink;
use crate::queue::JobQueue;
use crate::worker::Worker;
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

pub const GAUGE_INTERVAL: Duration = Duration::from_secs(30);

/// A fixed number of identical workers on one shared queue.
pub struct WorkerPool {
    worker: Worker,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<dyn MetricsSink>,
    workers_count: usize,
    gauge_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        worker: Worker,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<dyn MetricsSink>,
        workers_count: usize,
    ) -> Self {
        WorkerPool {
            worker,
            queue,
            metrics,
            workers_count,
            gauge_interval: GAUGE_INTERVAL,
        }
    }

    pub fn with_gauge_interval(mut self, gauge_interval: Duration) -> Self {
        self.gauge_interval = gauge_interval;
        self
    }

    /// Runs until `cancel_token` fires, then waits for every worker to
    /// finish its current job.
    pub async fn run(self, cancel_token: CancellationToken) -> Result<(), Error> {
        info!(message = "Starting workers", workers = self.workers_count);

        let mut workers = vec![];
        for worker_id in 0..self.workers_count {
            let worker = self.worker.clone();
            let cancel_token = cancel_token.clone();
            let join_handle = tokio::spawn(
                async move {
                    worker.start(cancel_token).await;
                }
                .instrument(info_span!("worker", worker_id)),
            );
            workers.push(join_handle);
        }

        let sampler = tokio::spawn(
            sample_gauges(
                self.queue.clone(),
                self.metrics.clone(),
                self.gauge_interval,
                cancel_token.clone(),
            )
            .instrument(info_span!("gauges")),
        );

        // Wait for all workers to complete
        let joined = futures::future::join_all(workers)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>();

        // A panicked worker returns here without a shutdown signal.
        cancel_token.cancel();
        sampler.await?;
        joined?;

        info!("Worker pool stopped.");
        Ok(())
    }
}

async fn sample_gauges(
    queue: Arc<dyn JobQueue>,
    metrics: Arc<dyn MetricsSink>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let depth = queue.queue_depth().await;
        let processing = queue.processing_count().await;
        match (depth, processing) {
            (Ok(depth), Ok(processing)) => metrics.queue_gauges(depth, processing),
            (Err(err), _) | (_, Err(err)) => {
                warn!(message = "Failed to sample queue gauges", error = ?err);
            }
        }
    }
}
