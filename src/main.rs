use anyhow::Error;
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use alldownloads::config::{Command, Config, WorkerConfig};
use alldownloads::db::DbHandle;
use alldownloads::enqueue;
use alldownloads::metrics::LogMetrics;
use alldownloads::pool::WorkerPool;
use alldownloads::queue::{JobQueue, RedisQueue};
use alldownloads::sources::{HttpClient, SourceRegistry};
use alldownloads::store::CatalogStore;
use alldownloads::telemetry;
use alldownloads::worker::{Worker, WorkerSettings};
use alldownloads::{Product, ProductVersion};

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    let db = DbHandle::new(&config.database_url, config.db_max_connections).await?;
    let queue = RedisQueue::connect(&config.redis_url)
        .await?
        .with_queue_key(&config.queue_key);
    let store: Arc<dyn CatalogStore> = Arc::new(db);
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    match config.command {
        Command::Worker(worker_config) => run_worker(worker_config, store, queue, cancel_token).await,
        Command::Refresh => {
            let summary = enqueue::refresh_all(store.as_ref(), queue.as_ref()).await?;
            println!("Queued {} fetch jobs", summary.queued());
            Ok(())
        }
        Command::Status => print_status(store.as_ref(), queue.as_ref()).await,
    }
}

async fn run_worker(
    config: WorkerConfig,
    store: Arc<dyn CatalogStore>,
    queue: Arc<dyn JobQueue>,
    cancel_token: CancellationToken,
) -> Result<(), Error> {
    let http = HttpClient::new(config.http_timeout())?;
    let sources = Arc::new(SourceRegistry::builtin(http)?);
    info!(message = "Sources registered", sources = sources.product_ids().count());
    enqueue::sync_catalog(store.as_ref(), &sources).await;

    let metrics = Arc::new(LogMetrics::new());
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        metrics.clone(),
        WorkerSettings {
            dequeue_timeout: config.dequeue_timeout(),
            fetch_timeout: config.fetch_timeout(),
        },
    );

    let scheduler = config.refresh_interval().map(|period| {
        tokio::spawn(
            enqueue::run_scheduler(store.clone(), queue.clone(), period, cancel_token.clone())
                .instrument(info_span!("scheduler")),
        )
    });

    let pool = WorkerPool::new(worker, queue, metrics.clone(), usize::from(config.workers));
    let result = pool.run(cancel_token.clone()).await;

    // The pool only returns early on a panicked worker.
    cancel_token.cancel();
    if let Some(scheduler) = scheduler {
        scheduler.await?;
    }

    info!(
        message = "Workers finished",
        completed = metrics.completed(),
        failed = metrics.failed()
    );
    result
}

#[derive(Serialize)]
struct Status {
    queue_depth: u64,
    processing: u64,
    products: Vec<ProductStatus>,
}

#[derive(Serialize)]
struct ProductStatus {
    #[serde(flatten)]
    product: Product,
    latest: Vec<ProductVersion>,
}

async fn print_status(store: &dyn CatalogStore, queue: &dyn JobQueue) -> Result<(), Error> {
    let mut products = vec![];
    for product in store.list_products().await? {
        let latest = store
            .list_versions(&product.id)
            .await?
            .into_iter()
            .filter(|version| version.is_latest)
            .collect();
        products.push(ProductStatus { product, latest });
    }

    let status = Status {
        queue_depth: queue.queue_depth().await?,
        processing: queue.processing_count().await?,
        products,
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    telemetry::init(&config.telemetry)?;

    let token = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        signal_token.cancel();
    });

    let app = tokio::spawn(setup(config, token));
    let result = app.await?;
    if let Err(err) = &result {
        error!(message = "Fatal error", error = ?err);
    }
    debug!("Shutting down.");
    telemetry::shutdown();

    Ok(result?)
}
