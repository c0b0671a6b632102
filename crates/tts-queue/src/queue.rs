// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Queue Protocol (spec §4.3), grounded on `yapit/workers/queue.py`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tts_protocol::{DocumentId, Fingerprint, SynthesisJob, UserId, WorkerResult};
use uuid::Uuid;

use crate::error::QueueError;
use crate::keys::{
    self, DLQ_TTL_SECONDS, INFLIGHT_TTL_SECONDS, JOBS_HASH, JOB_INDEX_HASH, PROCESSING_PATTERN,
    RATELIMIT_WINDOW_SECONDS, RESULTS_LIST, SUBSCRIBER_TTL_SECONDS,
};
use crate::types::{FailureRecord, ProcessingEntry, PulledJob, SubscriberEntry};

/// The queue protocol between the gateway and pull workers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Write the job body to the jobs-hash, optionally index it for O(1)
    /// cursor eviction, and schedule it on its model's sorted-set queue.
    async fn push(&self, job: &SynthesisJob, index_field: Option<&str>) -> Result<(), QueueError>;

    /// Blocking pop of the earliest-scheduled job for `model_slug`. Returns
    /// `None` on timeout, or if the body was evicted between the pop and
    /// the hash lookup (the worker must tolerate this).
    async fn pull(
        &self,
        model_slug: &str,
        timeout: Duration,
    ) -> Result<Option<PulledJob>, QueueError>;

    /// Record that `worker_id` has claimed `job` and is about to begin
    /// synthesis, before any potentially blocking call.
    async fn track_processing(
        &self,
        worker_id: &str,
        job: &SynthesisJob,
        queue_name: &str,
        dlq_key: &str,
    ) -> Result<(), QueueError>;

    /// Remove a job from a worker's processing set after it has posted a
    /// result.
    async fn complete_processing(&self, worker_id: &str, job_id: Uuid) -> Result<(), QueueError>;

    /// Re-enqueue `job` (already carrying its incremented `retry_count`)
    /// with a fresh schedule score.
    async fn requeue(&self, job: &SynthesisJob) -> Result<(), QueueError>;

    /// Move an exhausted job to its model's dead-letter list.
    async fn move_to_dlq(&self, model_slug: &str, job: &SynthesisJob) -> Result<(), QueueError>;

    /// Record a failure discovered too late to resubmit a `SynthesisJob`
    /// (the Result Consumer only ever holds a `WorkerResult`), onto the
    /// same per-model dead-letter list `move_to_dlq` uses.
    async fn move_failure_to_dlq(
        &self,
        model_slug: &str,
        record: &FailureRecord,
    ) -> Result<(), QueueError>;

    /// Enumerate every worker's processing hash, for the Visibility
    /// Scanner's periodic sweep.
    async fn scan_processing_entries(
        &self,
    ) -> Result<Vec<(String, Vec<(Uuid, ProcessingEntry)>)>, QueueError>;

    /// Push a worker's result onto the shared results list.
    async fn push_result(&self, result: &WorkerResult) -> Result<(), QueueError>;

    /// Blocking pop of the next pending result. Returns `None` on timeout.
    async fn pull_result(&self, timeout: Duration) -> Result<Option<WorkerResult>, QueueError>;

    /// Attempt to acquire the in-flight deduplication lock for a
    /// fingerprint. Returns `true` if this caller now owns it.
    async fn acquire_inflight_lock(&self, fingerprint: &Fingerprint) -> Result<bool, QueueError>;

    /// Release the in-flight lock (called by the Result Consumer once a
    /// fingerprint's synthesis is finalized, successfully or not).
    async fn release_inflight_lock(&self, fingerprint: &Fingerprint) -> Result<(), QueueError>;

    /// Add `(user, document, block)` to a fingerprint's subscriber set.
    async fn add_subscriber(
        &self,
        fingerprint: &Fingerprint,
        entry: SubscriberEntry,
    ) -> Result<(), QueueError>;

    /// Read and clear a fingerprint's subscriber set (called once, on
    /// finalize).
    async fn take_subscribers(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<SubscriberEntry>, QueueError>;

    /// Add a block index to a user's pending-set for a document.
    async fn add_pending(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<(), QueueError>;

    /// Remove a block index from a user's pending-set for a document.
    async fn remove_pending(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<(), QueueError>;

    /// Read a user's full pending-set for a document.
    async fn pending_members(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<HashSet<u32>, QueueError>;

    /// If a queued (not yet pulled) job exists for `(user, document,
    /// block)`, remove it from the queue, the jobs-hash, and the
    /// index-hash. The job's own `model_slug` determines which model
    /// queue to `ZREM` from. Returns `true` if a job was evicted.
    async fn evict_job(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<bool, QueueError>;

    /// Increment and check a user's per-minute rate-limit counter. Returns
    /// `true` if the request is allowed.
    async fn check_rate_limit(&self, user_id: UserId, limit: u32) -> Result<bool, QueueError>;

    /// Acquire a generic named NX lock with the given TTL, used for leader
    /// election of singleton background tasks (Visibility Scanner).
    async fn acquire_leader_lock(&self, name: &str, ttl: Duration) -> Result<bool, QueueError>;
}

/// `redis`-backed `Queue`, using a shared, auto-reconnecting
/// `ConnectionManager`.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push(&self, job: &SynthesisJob, index_field: Option<&str>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(job)?;
        let job_id = job.job_id.to_string();

        let () = conn.hset(JOBS_HASH, &job_id, &body).await?;
        if let Some(field) = index_field {
            let () = conn.hset(JOB_INDEX_HASH, field, &job_id).await?;
        }
        let () = conn
            .zadd(keys::queue_key(&job.model_slug), &job_id, job.queued_at_ms as f64)
            .await?;
        Ok(())
    }

    async fn pull(
        &self,
        model_slug: &str,
        timeout: Duration,
    ) -> Result<Option<PulledJob>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String, f64)> = conn
            .bzpopmin(keys::queue_key(model_slug), timeout.as_secs_f64())
            .await?;
        let Some((_key, job_id, _score)) = popped else {
            return Ok(None);
        };

        let body: Option<String> = conn.hget(JOBS_HASH, &job_id).await?;
        let Some(body) = body else {
            // Evicted between the pop and the lookup; the worker tolerates this.
            return Ok(None);
        };
        let () = conn.hdel(JOBS_HASH, &job_id).await?;

        let job: SynthesisJob = serde_json::from_str(&body)?;
        Ok(Some(PulledJob {
            job,
            index_field: None,
        }))
    }

    async fn track_processing(
        &self,
        worker_id: &str,
        job: &SynthesisJob,
        queue_name: &str,
        dlq_key: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let entry = ProcessingEntry {
            processing_started_ms: Utc::now().timestamp_millis(),
            retry_count: job.retry_count,
            job: job.clone(),
            queue_name: queue_name.to_string(),
            dlq_key: dlq_key.to_string(),
        };
        let body = serde_json::to_string(&entry)?;
        let () = conn
            .hset(keys::processing_key(worker_id), job.job_id.to_string(), body)
            .await?;
        Ok(())
    }

    async fn complete_processing(&self, worker_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let () = conn
            .hdel(keys::processing_key(worker_id), job_id.to_string())
            .await?;
        Ok(())
    }

    async fn requeue(&self, job: &SynthesisJob) -> Result<(), QueueError> {
        let mut job = job.clone();
        job.queued_at_ms = Utc::now().timestamp_millis();
        self.push(&job, None).await
    }

    async fn move_to_dlq(&self, model_slug: &str, job: &SynthesisJob) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(job)?;
        let dlq = keys::dlq_key(model_slug);
        let () = conn.lpush(&dlq, body).await?;
        let () = conn.expire(&dlq, DLQ_TTL_SECONDS).await?;
        Ok(())
    }

    async fn move_failure_to_dlq(
        &self,
        model_slug: &str,
        record: &FailureRecord,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(record)?;
        let dlq = keys::dlq_key(model_slug);
        let () = conn.lpush(&dlq, body).await?;
        let () = conn.expire(&dlq, DLQ_TTL_SECONDS).await?;
        Ok(())
    }

    async fn scan_processing_entries(
        &self,
    ) -> Result<Vec<(String, Vec<(Uuid, ProcessingEntry)>)>, QueueError> {
        let mut conn = self.conn.clone();
        let worker_keys: Vec<String> = conn.keys(PROCESSING_PATTERN).await?;
        let mut out = Vec::with_capacity(worker_keys.len());
        for key in worker_keys {
            let worker_id = key
                .strip_prefix("tts:processing:")
                .unwrap_or(&key)
                .to_string();
            let entries: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
            let mut parsed = Vec::with_capacity(entries.len());
            for (job_id, body) in entries {
                if let (Ok(job_id), Ok(entry)) = (
                    Uuid::parse_str(&job_id),
                    serde_json::from_str::<ProcessingEntry>(&body),
                ) {
                    parsed.push((job_id, entry));
                }
            }
            out.push((worker_id, parsed));
        }
        Ok(out)
    }

    async fn push_result(&self, result: &WorkerResult) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(result)?;
        let () = conn.lpush(RESULTS_LIST, body).await?;
        Ok(())
    }

    async fn pull_result(&self, timeout: Duration) -> Result<Option<WorkerResult>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.brpop(RESULTS_LIST, timeout.as_secs_f64()).await?;
        let Some((_key, body)) = popped else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&body)?))
    }

    async fn acquire_inflight_lock(&self, fingerprint: &Fingerprint) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::inflight_key(fingerprint.as_str());
        let acquired: bool = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(INFLIGHT_TTL_SECONDS)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;
        Ok(acquired)
    }

    async fn release_inflight_lock(&self, fingerprint: &Fingerprint) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let () = conn.del(keys::inflight_key(fingerprint.as_str())).await?;
        Ok(())
    }

    async fn add_subscriber(
        &self,
        fingerprint: &Fingerprint,
        entry: SubscriberEntry,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::subscribers_key(fingerprint.as_str());
        let member = serde_json::to_string(&entry)?;
        let () = conn.sadd(&key, member).await?;
        let () = conn.expire(&key, SUBSCRIBER_TTL_SECONDS).await?;
        Ok(())
    }

    async fn take_subscribers(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<SubscriberEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::subscribers_key(fingerprint.as_str());
        let members: Vec<String> = conn.smembers(&key).await?;
        let () = conn.del(&key).await?;
        Ok(members
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect())
    }

    async fn add_pending(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::pending_key(&user_id.to_string(), &document_id.to_string());
        let () = conn.sadd(&key, block_index).await?;
        let () = conn.expire(&key, SUBSCRIBER_TTL_SECONDS).await?;
        Ok(())
    }

    async fn remove_pending(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::pending_key(&user_id.to_string(), &document_id.to_string());
        let () = conn.srem(&key, block_index).await?;
        Ok(())
    }

    async fn pending_members(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<HashSet<u32>, QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::pending_key(&user_id.to_string(), &document_id.to_string());
        let members: HashSet<u32> = conn.smembers(&key).await?;
        Ok(members)
    }

    async fn evict_job(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let field = keys::index_field(&user_id.to_string(), &document_id.to_string(), block_index);
        let job_id: Option<String> = conn.hget(JOB_INDEX_HASH, &field).await?;
        let Some(job_id) = job_id else {
            return Ok(false);
        };
        let body: Option<String> = conn.hget(JOBS_HASH, &job_id).await?;
        if let Some(body) = body {
            if let Ok(job) = serde_json::from_str::<SynthesisJob>(&body) {
                let () = conn.zrem(keys::queue_key(&job.model_slug), &job_id).await?;
            }
        }
        let () = conn.hdel(JOBS_HASH, &job_id).await?;
        let () = conn.hdel(JOB_INDEX_HASH, &field).await?;
        Ok(true)
    }

    async fn check_rate_limit(&self, user_id: UserId, limit: u32) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let key = keys::ratelimit_key(&user_id.to_string());
        let count: u32 = conn.incr(&key, 1).await?;
        if count == 1 {
            let () = conn.expire(&key, RATELIMIT_WINDOW_SECONDS).await?;
        }
        Ok(count <= limit)
    }

    async fn acquire_leader_lock(&self, name: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(format!("tts:leader:{name}"))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;
        Ok(acquired)
    }
}
