//! In-process queue and store with the same contracts as the Redis and
//! Postgres backends. Used by tests and for single-process experiments.

use crate::queue::{JobMessage, JobQueue, RetryDecision};
use crate::store::CatalogStore;
use crate::{FetchJob, JobStatus, Product, ProductDescriptor, ProductVersion};
use anyhow::{anyhow, bail, Error};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    // Front is the list head (push side), back is the tail (pop side).
    pending: VecDeque<String>,
    processing: HashSet<Uuid>,
}

/// List + set queue mirroring the Redis layout. Envelopes are kept in
/// their JSON wire form.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, Error> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory queue poisoned"))
    }

    fn push(&self, message: &JobMessage) -> Result<(), Error> {
        let payload = message.encode()?;
        self.lock()?.pending.push_front(payload);
        self.available.notify_one();
        Ok(())
    }

    /// Pops the tail and records it as processing under one lock.
    fn try_pop(&self) -> Result<Option<JobMessage>, Error> {
        let mut state = self.lock()?;
        let Some(raw) = state.pending.pop_back() else {
            return Ok(None);
        };
        let message = JobMessage::decode(&raw)?;
        state.processing.insert(message.id);
        Ok(Some(message))
    }

    pub fn is_processing(&self, job_id: Uuid) -> bool {
        self.lock()
            .map(|state| state.processing.contains(&job_id))
            .unwrap_or(false)
    }

    /// Ids of pending envelopes from head to tail.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.lock()
            .map(|state| {
                state
                    .pending
                    .iter()
                    .filter_map(|raw| JobMessage::decode(raw).ok())
                    .map(|message| message.id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), Error> {
        self.push(&JobMessage::new(job_id))
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobMessage>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop()? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<(), Error> {
        self.lock()?.processing.remove(&job_id);
        Ok(())
    }

    async fn retry_job(&self, message: JobMessage) -> Result<RetryDecision, Error> {
        let Some(next) = message.next_attempt() else {
            self.mark_completed(message.id).await?;
            return Ok(RetryDecision::Dropped {
                retries: message.retries,
            });
        };
        self.push(&next)?;
        self.lock()?.processing.remove(&next.id);
        Ok(RetryDecision::Requeued {
            retries: next.retries,
        })
    }

    async fn queue_depth(&self) -> Result<u64, Error> {
        Ok(self.lock()?.pending.len() as u64)
    }

    async fn processing_count(&self) -> Result<u64, Error> {
        Ok(self.lock()?.processing.len() as u64)
    }
}

#[derive(Default)]
struct Catalog {
    products: BTreeMap<String, Product>,
    // Insertion order breaks `created_at` ties during promotion.
    versions: Vec<ProductVersion>,
    jobs: HashMap<Uuid, FetchJob>,
}

#[derive(Default)]
pub struct MemoryStore {
    catalog: Mutex<Catalog>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Catalog>, Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("catalog store unavailable");
        }
        self.catalog
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))
    }

    fn update_job(&self, id: Uuid, apply: impl FnOnce(&mut FetchJob)) -> Result<(), Error> {
        let mut catalog = self.lock()?;
        if let Some(job) = catalog.jobs.get_mut(&id) {
            apply(job);
            job.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_products(&self) -> Result<Vec<Product>, Error> {
        let mut products: Vec<Product> = self.lock()?.products.values().cloned().collect();
        products.sort_by(|a, b| (&a.vendor, &a.name).cmp(&(&b.vendor, &b.name)));
        Ok(products)
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, Error> {
        Ok(self.lock()?.products.get(id).cloned())
    }

    async fn upsert_product(&self, descriptor: &ProductDescriptor) -> Result<(), Error> {
        let now = Utc::now();
        let mut catalog = self.lock()?;
        let fresh = Product::from_descriptor(descriptor, now);
        match catalog.products.get_mut(descriptor.id) {
            Some(existing) => {
                *existing = Product {
                    created_at: existing.created_at,
                    ..fresh
                };
            }
            None => {
                catalog.products.insert(fresh.id.clone(), fresh);
            }
        }
        Ok(())
    }

    async fn create_fetch_job(&self, product_id: &str) -> Result<FetchJob, Error> {
        let now = Utc::now();
        let job = FetchJob {
            id: Uuid::new_v4(),
            product_id: product_id.to_owned(),
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.lock()?.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_fetch_job(&self, id: Uuid) -> Result<Option<FetchJob>, Error> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn begin_job(&self, id: Uuid) -> Result<(), Error> {
        self.update_job(id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.completed_at = None;
            job.error = None;
        })
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), Error> {
        self.update_job(id, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        })
    }

    async fn fail_job(&self, id: Uuid, msg: &str) -> Result<(), Error> {
        self.update_job(id, |job| {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(msg.to_owned());
        })
    }

    async fn upsert_version(&self, version: &ProductVersion) -> Result<(), Error> {
        let mut catalog = self.lock()?;
        if !catalog.products.contains_key(&version.product_id) {
            bail!("unknown product {}", version.product_id);
        }
        let existing = catalog.versions.iter_mut().find(|row| {
            row.product_id == version.product_id
                && row.version == version.version
                && row.platform == version.platform
                && row.architecture == version.architecture
        });
        match existing {
            Some(row) => {
                row.download_url = version.download_url.clone();
                row.checksum = version.checksum.clone();
                row.checksum_type = version.checksum_type.clone();
                row.file_size = version.file_size;
                row.filename = version.filename.clone();
                row.etag = version.etag.clone();
                row.last_fetched = version.last_fetched;
                row.updated_at = version.updated_at;
            }
            None => catalog.versions.push(ProductVersion {
                is_latest: false,
                ..version.clone()
            }),
        }
        Ok(())
    }

    async fn promote_latest(&self, product_id: &str) -> Result<(), Error> {
        let mut catalog = self.lock()?;

        let mut newest: HashMap<(String, String), usize> = HashMap::new();
        for (index, row) in catalog.versions.iter().enumerate() {
            if row.product_id != product_id {
                continue;
            }
            let key = (row.platform.clone(), row.architecture.clone());
            // Vec position is the insertion order, so the later row wins a tie.
            let replace = match newest.get(&key) {
                Some(&best) => row.created_at >= catalog.versions[best].created_at,
                None => true,
            };
            if replace {
                newest.insert(key, index);
            }
        }

        let winners: HashSet<usize> = newest.into_values().collect();
        for (index, row) in catalog.versions.iter_mut().enumerate() {
            if row.product_id == product_id {
                row.is_latest = winners.contains(&index);
            }
        }
        Ok(())
    }

    async fn list_versions(&self, product_id: &str) -> Result<Vec<ProductVersion>, Error> {
        let mut versions: Vec<(usize, ProductVersion)> = self
            .lock()?
            .versions
            .iter()
            .filter(|row| row.product_id == product_id)
            .cloned()
            .enumerate()
            .collect();
        versions.sort_by(|(a_seq, a), (b_seq, b)| {
            (&a.platform, &a.architecture)
                .cmp(&(&b.platform, &b.architecture))
                .then(b.created_at.cmp(&a.created_at))
                .then(b_seq.cmp(a_seq))
        });
        Ok(versions.into_iter().map(|(_, row)| row).collect())
    }
}
