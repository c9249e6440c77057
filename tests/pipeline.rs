//! Worker, queue and store driven together against the in-process backends.

use alldownloads::enqueue::{refresh_all, sync_catalog};
use alldownloads::memory::{MemoryQueue, MemoryStore};
use alldownloads::metrics::RecordingMetrics;
use alldownloads::pool::WorkerPool;
use alldownloads::queue::{JobMessage, JobQueue, RetryDecision, RETRY_LIMIT};
use alldownloads::sources::{FetchContext, Source, SourceError, SourceRegistry};
use alldownloads::store::CatalogStore;
use alldownloads::worker::{Outcome, Worker, WorkerSettings};
use alldownloads::{
    Arch, Category, Checksum, FetchJob, JobStatus, Platform, Product, ProductDescriptor,
    ProductVersion, VersionRecord,
};
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const UBUNTU: ProductDescriptor = ProductDescriptor {
    id: "ubuntu",
    name: "Ubuntu",
    vendor: "Canonical",
    category: Category::Os,
    description: "",
    icon_url: "",
    website_url: "https://ubuntu.com/",
};

const UNKNOWN_APP: ProductDescriptor = ProductDescriptor {
    id: "unknown-app",
    name: "Unknown",
    vendor: "Nobody",
    category: Category::App,
    description: "",
    icon_url: "",
    website_url: "",
};

fn record(version: &str, platform: Platform, arch: Arch) -> VersionRecord {
    let filename = format!("ubuntu-{version}-desktop-{}.iso", arch.as_str());
    VersionRecord {
        version: version.to_owned(),
        platform,
        arch,
        download_url: format!("https://releases.ubuntu.com/{version}/{filename}"),
        checksum: Some(Checksum::sha256("e3b0c44298fc1c149afbf4c8996fb924")),
        file_size: 4_800_000_000,
        filename,
    }
}

/// Returns the same records on every fetch.
struct StaticSource {
    descriptor: ProductDescriptor,
    records: Vec<VersionRecord>,
}

#[async_trait]
impl Source for StaticSource {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        cx.check()?;
        Ok(self.records.clone())
    }
}

/// Never finishes on its own; only the fetch budget ends it.
struct StalledSource {
    descriptor: ProductDescriptor,
}

#[async_trait]
impl Source for StalledSource {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        cx.run(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        })
        .await
    }
}

struct PanickingSource {
    descriptor: ProductDescriptor,
}

#[async_trait]
impl Source for PanickingSource {
    fn descriptor(&self) -> &ProductDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, _cx: &FetchContext) -> Result<Vec<VersionRecord>, SourceError> {
        panic!("parser bug");
    }
}

/// Delegates to a [`MemoryStore`] but refuses to save rows of one architecture.
struct RejectingStore {
    inner: MemoryStore,
    rejected_arch: &'static str,
}

#[async_trait]
impl CatalogStore for RejectingStore {
    async fn list_products(&self) -> Result<Vec<Product>, Error> {
        self.inner.list_products().await
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, Error> {
        self.inner.get_product(id).await
    }

    async fn upsert_product(&self, descriptor: &ProductDescriptor) -> Result<(), Error> {
        self.inner.upsert_product(descriptor).await
    }

    async fn create_fetch_job(&self, product_id: &str) -> Result<FetchJob, Error> {
        self.inner.create_fetch_job(product_id).await
    }

    async fn get_fetch_job(&self, id: Uuid) -> Result<Option<FetchJob>, Error> {
        self.inner.get_fetch_job(id).await
    }

    async fn begin_job(&self, id: Uuid) -> Result<(), Error> {
        self.inner.begin_job(id).await
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), Error> {
        self.inner.complete_job(id).await
    }

    async fn fail_job(&self, id: Uuid, msg: &str) -> Result<(), Error> {
        self.inner.fail_job(id, msg).await
    }

    async fn upsert_version(&self, version: &ProductVersion) -> Result<(), Error> {
        if version.architecture == self.rejected_arch {
            return Err(anyhow!("constraint violation"));
        }
        self.inner.upsert_version(version).await
    }

    async fn promote_latest(&self, product_id: &str) -> Result<(), Error> {
        self.inner.promote_latest(product_id).await
    }

    async fn list_versions(&self, product_id: &str) -> Result<Vec<ProductVersion>, Error> {
        self.inner.list_versions(product_id).await
    }
}

/// Fails the first enqueue it sees, then behaves.
struct FlakyQueue {
    inner: MemoryQueue,
    tripped: AtomicBool,
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), Error> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("connection reset"));
        }
        self.inner.enqueue(job_id).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobMessage>, Error> {
        self.inner.dequeue(timeout).await
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<(), Error> {
        self.inner.mark_completed(job_id).await
    }

    async fn retry_job(&self, message: JobMessage) -> Result<RetryDecision, Error> {
        self.inner.retry_job(message).await
    }

    async fn queue_depth(&self) -> Result<u64, Error> {
        self.inner.queue_depth().await
    }

    async fn processing_count(&self) -> Result<u64, Error> {
        self.inner.processing_count().await
    }
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        dequeue_timeout: Duration::from_millis(50),
        fetch_timeout: Duration::from_secs(5),
    }
}

fn ubuntu_registry() -> SourceRegistry {
    SourceRegistry::new().with(Arc::new(StaticSource {
        descriptor: UBUNTU,
        records: vec![
            record("24.04", Platform::Linux, Arch::Amd64),
            record("24.04", Platform::Linux, Arch::X86),
        ],
    }))
}

async fn queue_job(store: &dyn CatalogStore, queue: &dyn JobQueue, product_id: &str) -> Uuid {
    let job = store.create_fetch_job(product_id).await.unwrap();
    queue.enqueue(job.id).await.unwrap();
    job.id
}

// ================================================================================================
// SUCCESSFUL FETCHES
// ================================================================================================

#[tokio::test]
async fn ubuntu_fetch_stores_latest_row_per_architecture() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let sources = Arc::new(ubuntu_registry());
    assert_eq!(sync_catalog(store.as_ref(), &sources).await, 1);

    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        metrics.clone(),
        settings(),
    );
    let job_id = queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;

    let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    let outcome = worker.handle(message).await.unwrap();

    assert_eq!(outcome, Outcome::Completed { versions: 2 });

    let versions = store.list_versions("ubuntu").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.is_latest));
    let mut groups: Vec<_> = versions.iter().map(|v| v.group()).collect();
    groups.sort();
    assert_eq!(groups, vec![("linux", "386"), ("linux", "amd64")]);

    let job = store.get_fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());

    assert!(!queue.is_processing(job_id));
    assert_eq!(queue.processing_count().await.unwrap(), 0);
    assert_eq!(metrics.count(JobStatus::Completed), 1);
    assert_eq!(metrics.snapshot().versions["ubuntu"], 2);
}

#[tokio::test]
async fn refetch_keeps_one_latest_row_per_group() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sources = Arc::new(ubuntu_registry());
    sync_catalog(store.as_ref(), &sources).await;
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        Arc::new(RecordingMetrics::new()),
        settings(),
    );

    for _ in 0..2 {
        queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;
        let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        worker.handle(message).await.unwrap();
    }

    let versions = store.list_versions("ubuntu").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.iter().filter(|v| v.is_latest).count(), 2);
}

#[tokio::test]
async fn version_that_cannot_be_saved_is_skipped() {
    let store = Arc::new(RejectingStore {
        inner: MemoryStore::new(),
        rejected_arch: "386",
    });
    let queue = Arc::new(MemoryQueue::new());
    let sources = Arc::new(ubuntu_registry());
    sync_catalog(store.as_ref(), &sources).await;
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        Arc::new(RecordingMetrics::new()),
        settings(),
    );
    let job_id = queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;

    let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    let outcome = worker.handle(message).await.unwrap();

    assert_eq!(outcome, Outcome::Completed { versions: 2 });
    let versions = store.list_versions("ubuntu").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].architecture, "amd64");
    assert!(versions[0].is_latest);

    let job = store.get_fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn later_listed_version_wins_its_group() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sources = Arc::new(SourceRegistry::new().with(Arc::new(StaticSource {
        descriptor: UBUNTU,
        records: vec![
            record("22.04", Platform::Linux, Arch::Amd64),
            record("24.04", Platform::Linux, Arch::Amd64),
        ],
    })));
    sync_catalog(store.as_ref(), &sources).await;
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        Arc::new(RecordingMetrics::new()),
        settings(),
    );
    queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;

    let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    worker.handle(message).await.unwrap();

    let versions = store.list_versions("ubuntu").await.unwrap();
    let latest: Vec<_> = versions.iter().filter(|v| v.is_latest).collect();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version, "24.04");
    assert_eq!(versions[0].version, "24.04");
    assert_eq!(versions[1].version, "22.04");
    assert!(versions[0].created_at >= versions[1].created_at);
}

// ================================================================================================
// FAILURES AND RETRIES
// ================================================================================================

#[tokio::test]
async fn unknown_product_fails_after_retry_budget() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let metrics = Arc::new(RecordingMetrics::new());
    store.upsert_product(&UNKNOWN_APP).await.unwrap();
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        Arc::new(SourceRegistry::new()),
        metrics.clone(),
        settings(),
    );
    let job_id = queue_job(store.as_ref(), queue.as_ref(), "unknown-app").await;

    let mut deliveries = 0;
    while let Some(message) = queue.dequeue(Duration::from_millis(50)).await.unwrap() {
        assert_eq!(message.id, job_id);
        assert_eq!(message.retries, deliveries);
        deliveries += 1;

        let outcome = worker.handle(message).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
    }

    assert_eq!(deliveries, RETRY_LIMIT + 1);

    let job = store.get_fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(job.completed_at.is_some());

    assert_eq!(queue.queue_depth().await.unwrap(), 0);
    assert!(!queue.is_processing(job_id));
    assert_eq!(metrics.count(JobStatus::Failed), 4);
}

#[tokio::test]
async fn missing_product_row_is_a_job_failure() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        Arc::new(ubuntu_registry()),
        Arc::new(RecordingMetrics::new()),
        settings(),
    );
    let job_id = queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;

    let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    let outcome = worker.handle(message).await.unwrap();

    assert_eq!(outcome, Outcome::Failed("product ubuntu not found".into()));
    assert_eq!(queue.pending_ids(), vec![job_id]);
    assert!(!queue.is_processing(job_id));
}

#[tokio::test]
async fn stalled_fetch_times_out() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sources = Arc::new(SourceRegistry::new().with(Arc::new(StalledSource {
        descriptor: UBUNTU,
    })));
    sync_catalog(store.as_ref(), &sources).await;
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        Arc::new(RecordingMetrics::new()),
        WorkerSettings {
            dequeue_timeout: Duration::from_millis(50),
            fetch_timeout: Duration::from_millis(100),
        },
    );
    let job_id = queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;

    let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), worker.handle(message))
        .await
        .unwrap()
        .unwrap();

    let Outcome::Failed(reason) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("timed out"), "unexpected reason: {reason}");
    let job = store.get_fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(queue.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn status_update_failure_drops_envelope() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let sources = Arc::new(ubuntu_registry());
    sync_catalog(store.as_ref(), &sources).await;
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        Arc::new(RecordingMetrics::new()),
        settings(),
    );
    let job_id = queue_job(store.as_ref(), queue.as_ref(), "ubuntu").await;

    let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
    store.set_unavailable(true);
    assert!(worker.handle(message).await.is_err());
    store.set_unavailable(false);

    // Neither retried nor acknowledged.
    assert_eq!(queue.queue_depth().await.unwrap(), 0);
    assert!(queue.is_processing(job_id));
    let job = store.get_fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

// ================================================================================================
// QUEUE AND ENQUEUER
// ================================================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_enqueue_is_delivered_once() {
    let queue = Arc::new(MemoryQueue::new());
    let job_id = Uuid::new_v4();
    queue.enqueue(job_id).await.unwrap();

    let (first, second) = tokio::join!(
        queue.dequeue(Duration::from_millis(200)),
        queue.dequeue(Duration::from_millis(200)),
    );
    let delivered: Vec<_> = [first.unwrap(), second.unwrap()]
        .into_iter()
        .flatten()
        .collect();

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, job_id);
}

#[tokio::test]
async fn refresh_skips_product_that_cannot_be_enqueued() {
    let store = MemoryStore::new();
    let queue = FlakyQueue {
        inner: MemoryQueue::new(),
        tripped: AtomicBool::new(false),
    };
    store.upsert_product(&UBUNTU).await.unwrap();
    store.upsert_product(&UNKNOWN_APP).await.unwrap();

    let summary = refresh_all(&store, &queue).await.unwrap();

    assert_eq!(summary.queued(), 1);
    assert_eq!(queue.queue_depth().await.unwrap(), 1);
    assert_eq!(queue.inner.pending_ids(), summary.job_ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_drains_refresh_batch() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let sources = Arc::new(ubuntu_registry());
    sync_catalog(store.as_ref(), &sources).await;
    store.upsert_product(&UNKNOWN_APP).await.unwrap();

    let summary = refresh_all(store.as_ref(), queue.as_ref()).await.unwrap();
    assert_eq!(summary.queued(), 2);

    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        metrics.clone(),
        settings(),
    );
    let cancel_token = CancellationToken::new();
    let pool = tokio::spawn(
        WorkerPool::new(worker, queue.clone(), metrics.clone(), 3).run(cancel_token.clone()),
    );

    // One completion plus four failed deliveries of the unknown product.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while metrics.snapshot().finished.len() < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel_token.cancel();
    pool.await.unwrap().unwrap();

    assert_eq!(metrics.count(JobStatus::Completed), 1);
    assert_eq!(metrics.count(JobStatus::Failed), 4);
    for job_id in summary.job_ids {
        let job = store.get_fetch_job(job_id).await.unwrap().unwrap();
        assert!(job.status.is_terminal());
    }
    assert_eq!(queue.queue_depth().await.unwrap(), 0);
    assert_eq!(queue.processing_count().await.unwrap(), 0);
}

#[tokio::test]
async fn panicked_worker_stops_the_pool() {
    const BROKEN: ProductDescriptor = ProductDescriptor {
        id: "broken",
        ..UNKNOWN_APP
    };
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let sources = Arc::new(SourceRegistry::new().with(Arc::new(PanickingSource {
        descriptor: BROKEN,
    })));
    sync_catalog(store.as_ref(), &sources).await;
    queue_job(store.as_ref(), queue.as_ref(), "broken").await;

    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        sources,
        metrics.clone(),
        settings(),
    );
    let cancel_token = CancellationToken::new();
    let pool = WorkerPool::new(worker, queue.clone(), metrics.clone(), 1)
        .with_gauge_interval(Duration::from_millis(10));

    let result = tokio::time::timeout(Duration::from_secs(5), pool.run(cancel_token.clone()))
        .await
        .unwrap();

    assert!(result.is_err());
    assert!(cancel_token.is_cancelled());
    let sampled = metrics.snapshot().gauges.len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(metrics.snapshot().gauges.len(), sampled);
}
