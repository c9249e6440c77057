use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::*;
use uuid::Uuid;

/// Pending envelopes. Pushed on the left, popped on the right.
pub const QUEUE_KEY: &str = "fetch_jobs";
/// Ids of envelopes handed to a worker and not yet acknowledged.
pub const PROCESSING_KEY: &str = "fetch_jobs:processing";
/// Deliveries beyond the first before an envelope is dropped.
pub const RETRY_LIMIT: u32 = 3;
/// Backoff intended between retries. Retries are currently re-pushed
/// immediately and this value is not applied.
pub const RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Queue envelope referencing a `fetch_jobs` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: Uuid,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(id: Uuid) -> Self {
        JobMessage {
            id,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).context("failed to encode job message")
    }

    pub fn decode(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).context("failed to decode job message")
    }

    /// The envelope for the next delivery, or `None` once the retry budget is spent.
    pub fn next_attempt(&self) -> Option<JobMessage> {
        if self.retries >= RETRY_LIMIT {
            return None;
        }
        Some(JobMessage {
            retries: self.retries + 1,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeued { retries: u32 },
    Dropped { retries: u32 },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_id: Uuid) -> Result<(), Error>;

    /// Waits up to `timeout` for an envelope. `Ok(None)` means nothing arrived.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobMessage>, Error>;

    async fn mark_completed(&self, job_id: Uuid) -> Result<(), Error>;

    async fn retry_job(&self, message: JobMessage) -> Result<RetryDecision, Error>;

    async fn queue_depth(&self) -> Result<u64, Error>;

    async fn processing_count(&self) -> Result<u64, Error>;
}

pub struct RedisQueue {
    client: redis::Client,
    manager: ConnectionManager,
    queue_key: String,
    processing_key: String,
    // BRPOP parks a connection for the whole timeout, so blocking pops get
    // their own connections instead of stalling the shared manager.
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisQueue {
    #[instrument(name = "queue.connect", skip_all)]
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).context("failed to parse Redis URL")?;
        let mut manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to Redis")?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut manager)
            .await
            .context("failed to ping Redis")?;

        Ok(RedisQueue {
            client,
            manager,
            queue_key: QUEUE_KEY.to_owned(),
            processing_key: PROCESSING_KEY.to_owned(),
            blocking: Mutex::new(Vec::new()),
        })
    }

    /// Moves the list to `queue_key` and the processing set to `{queue_key}:processing`.
    pub fn with_queue_key(mut self, queue_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self.processing_key = format!("{}:processing", self.queue_key);
        self
    }

    async fn checkout(&self) -> Result<MultiplexedConnection, Error> {
        let pooled = self
            .blocking
            .lock()
            .map_err(|_| anyhow!("blocking connection pool poisoned"))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        if let Ok(mut pool) = self.blocking.lock() {
            pool.push(conn);
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    #[instrument(name = "queue.enqueue", skip(self))]
    async fn enqueue(&self, job_id: Uuid) -> Result<(), Error> {
        let payload = JobMessage::new(job_id).encode()?;
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, payload)
            .await
            .context("failed to enqueue job")?;

        info!(message = "Job enqueued", job_id = %job_id);
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobMessage>, Error> {
        let mut conn = self.checkout().await?;
        // A zero timeout would block forever.
        let seconds = timeout.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.queue_key)
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .context("failed to dequeue job")?;
        self.checkin(conn);

        let Some((_, raw)) = popped else {
            return Ok(None);
        };
        let message = JobMessage::decode(&raw)?;

        let mut conn = self.manager.clone();
        if let Err(err) = conn
            .sadd::<_, _, ()>(&self.processing_key, message.id.to_string())
            .await
        {
            error!(message = "Failed to add job to processing set", job_id = %message.id, error = ?err);
        }

        Ok(Some(message))
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<(), Error> {
        let mut conn = self.manager.clone();
        conn.srem::<_, _, ()>(&self.processing_key, job_id.to_string())
            .await
            .context("failed to remove job from processing set")?;

        debug!(message = "Job acknowledged", job_id = %job_id);
        Ok(())
    }

    async fn retry_job(&self, message: JobMessage) -> Result<RetryDecision, Error> {
        let Some(next) = message.next_attempt() else {
            error!(message = "Job exceeded retry limit", job_id = %message.id, retries = message.retries);
            self.mark_completed(message.id).await?;
            return Ok(RetryDecision::Dropped {
                retries: message.retries,
            });
        };

        let payload = next.encode()?;
        let mut conn = self.manager.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, payload)
            .await
            .context("failed to retry job")?;

        if let Err(err) = conn
            .srem::<_, _, ()>(&self.processing_key, next.id.to_string())
            .await
        {
            error!(message = "Failed to remove retried job from processing set", job_id = %next.id, error = ?err);
        }

        info!(message = "Job retried", job_id = %next.id, retries = next.retries);
        Ok(RetryDecision::Requeued {
            retries: next.retries,
        })
    }

    async fn queue_depth(&self) -> Result<u64, Error> {
        let mut conn = self.manager.clone();
        Ok(conn.llen(&self.queue_key).await?)
    }

    async fn processing_count(&self) -> Result<u64, Error> {
        let mut conn = self.manager.clone();
        Ok(conn.scard(&self.processing_key).await?)
    }
}
