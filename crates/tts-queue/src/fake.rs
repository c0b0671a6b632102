// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! An in-memory `Queue` for unit tests and the demo binaries. Mirrors the
//! same atomic-per-call semantics as `RedisQueue` without needing a live
//! Redis server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tts_protocol::{DocumentId, Fingerprint, SynthesisJob, UserId, WorkerResult};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::Queue;
use crate::types::{FailureRecord, ProcessingEntry, PulledJob, SubscriberEntry};

#[derive(Default)]
struct State {
    queues: HashMap<String, BTreeMap<i64, Uuid>>,
    jobs: HashMap<Uuid, SynthesisJob>,
    index: HashMap<String, Uuid>,
    processing: HashMap<String, HashMap<Uuid, ProcessingEntry>>,
    results: std::collections::VecDeque<WorkerResult>,
    inflight: HashSet<String>,
    subscribers: HashMap<String, HashSet<SubscriberEntry>>,
    pending: HashMap<(UserId, DocumentId), HashSet<u32>>,
    rate_limits: HashMap<UserId, u32>,
    leader_locks: HashSet<String>,
    dlq: HashMap<String, Vec<String>>,
}

/// In-memory `Queue`.
#[derive(Default)]
pub struct FakeQueue {
    state: Mutex<State>,
}

impl FakeQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dead-letter entries recorded for `model_slug`, for tests.
    pub fn dlq_len(&self, model_slug: &str) -> usize {
        self.state
            .lock()
            .expect("lock poisoned")
            .dlq
            .get(model_slug)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl Queue for FakeQueue {
    async fn push(&self, job: &SynthesisJob, index_field: Option<&str>) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.jobs.insert(job.job_id, job.clone());
        if let Some(field) = index_field {
            state.index.insert(field.to_string(), job.job_id);
        }
        state
            .queues
            .entry(job.model_slug.clone())
            .or_default()
            .insert(job.queued_at_ms, job.job_id);
        Ok(())
    }

    async fn pull(
        &self,
        model_slug: &str,
        _timeout: Duration,
    ) -> Result<Option<PulledJob>, QueueError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let job_id = {
            let Some(queue) = state.queues.get_mut(model_slug) else {
                return Ok(None);
            };
            let Some((&score, &job_id)) = queue.iter().next() else {
                return Ok(None);
            };
            queue.remove(&score);
            job_id
        };
        let Some(job) = state.jobs.remove(&job_id) else {
            return Ok(None);
        };
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
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .processing
            .entry(worker_id.to_string())
            .or_default()
            .insert(
                job.job_id,
                ProcessingEntry {
                    processing_started_ms: Utc::now().timestamp_millis(),
                    retry_count: job.retry_count,
                    job: job.clone(),
                    queue_name: queue_name.to_string(),
                    dlq_key: dlq_key.to_string(),
                },
            );
        Ok(())
    }

    async fn complete_processing(&self, worker_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(map) = state.processing.get_mut(worker_id) {
            map.remove(&job_id);
        }
        Ok(())
    }

    async fn requeue(&self, job: &SynthesisJob) -> Result<(), QueueError> {
        let mut job = job.clone();
        job.queued_at_ms = Utc::now().timestamp_millis();
        self.push(&job, None).await
    }

    async fn move_to_dlq(&self, model_slug: &str, job: &SynthesisJob) -> Result<(), QueueError> {
        let body = serde_json::to_string(job)?;
        self.state
            .lock()
            .expect("lock poisoned")
            .dlq
            .entry(model_slug.to_string())
            .or_default()
            .push(body);
        Ok(())
    }

    async fn move_failure_to_dlq(
        &self,
        model_slug: &str,
        record: &FailureRecord,
    ) -> Result<(), QueueError> {
        let body = serde_json::to_string(record)?;
        self.state
            .lock()
            .expect("lock poisoned")
            .dlq
            .entry(model_slug.to_string())
            .or_default()
            .push(body);
        Ok(())
    }

    async fn scan_processing_entries(
        &self,
    ) -> Result<Vec<(String, Vec<(Uuid, ProcessingEntry)>)>, QueueError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .processing
            .iter()
            .map(|(worker_id, entries)| {
                (
                    worker_id.clone(),
                    entries.iter().map(|(id, e)| (*id, e.clone())).collect(),
                )
            })
            .collect())
    }

    async fn push_result(&self, result: &WorkerResult) -> Result<(), QueueError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .results
            .push_back(result.clone());
        Ok(())
    }

    async fn pull_result(&self, _timeout: Duration) -> Result<Option<WorkerResult>, QueueError> {
        Ok(self.state.lock().expect("lock poisoned").results.pop_front())
    }

    async fn acquire_inflight_lock(&self, fingerprint: &Fingerprint) -> Result<bool, QueueError> {
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .inflight
            .insert(fingerprint.as_str().to_string()))
    }

    async fn release_inflight_lock(&self, fingerprint: &Fingerprint) -> Result<(), QueueError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .inflight
            .remove(fingerprint.as_str());
        Ok(())
    }

    async fn add_subscriber(
        &self,
        fingerprint: &Fingerprint,
        entry: SubscriberEntry,
    ) -> Result<(), QueueError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .subscribers
            .entry(fingerprint.as_str().to_string())
            .or_default()
            .insert(entry);
        Ok(())
    }

    async fn take_subscribers(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<SubscriberEntry>, QueueError> {
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .subscribers
            .remove(fingerprint.as_str())
            .map(|set| set.into_iter().collect())
            .unwrap_or_default())
    }

    async fn add_pending(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<(), QueueError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .pending
            .entry((user_id, document_id))
            .or_default()
            .insert(block_index);
        Ok(())
    }

    async fn remove_pending(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<(), QueueError> {
        if let Some(set) = self
            .state
            .lock()
            .expect("lock poisoned")
            .pending
            .get_mut(&(user_id, document_id))
        {
            set.remove(&block_index);
        }
        Ok(())
    }

    async fn pending_members(
        &self,
        user_id: UserId,
        document_id: DocumentId,
    ) -> Result<HashSet<u32>, QueueError> {
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .pending
            .get(&(user_id, document_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn evict_job(
        &self,
        user_id: UserId,
        document_id: DocumentId,
        block_index: u32,
    ) -> Result<bool, QueueError> {
        let field = crate::keys::index_field(&user_id.to_string(), &document_id.to_string(), block_index);
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(job_id) = state.index.remove(&field) else {
            return Ok(false);
        };
        let job = state.jobs.remove(&job_id);
        if let Some(job) = job {
            if let Some(queue) = state.queues.get_mut(&job.model_slug) {
                queue.retain(|_, id| *id != job.job_id);
            }
        }
        Ok(true)
    }

    async fn check_rate_limit(&self, user_id: UserId, limit: u32) -> Result<bool, QueueError> {
        let mut state = self.state.lock().expect("lock poisoned");
        let count = state.rate_limits.entry(user_id).or_insert(0);
        *count += 1;
        Ok(*count <= limit)
    }

    async fn acquire_leader_lock(&self, name: &str, _ttl: Duration) -> Result<bool, QueueError> {
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .leader_locks
            .insert(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn job(job_id: Uuid, model: &str, queued_at_ms: i64) -> SynthesisJob {
        SynthesisJob {
            job_id,
            fingerprint: Fingerprint::from_hex("abc123"),
            user_id: Uuid::nil(),
            document_id: Uuid::nil(),
            block_index: 0,
            model_slug: model.to_string(),
            voice_slug: "af_heart".to_string(),
            parameters: json!({}),
            text: "Hello.".to_string(),
            codec: "opus".to_string(),
            retry_count: 0,
            queued_at_ms,
        }
    }

    #[tokio::test]
    async fn pull_returns_jobs_in_score_order() {
        let queue = FakeQueue::new();
        let first = job(Uuid::new_v4(), "kokoro", 100);
        let second = job(Uuid::new_v4(), "kokoro", 200);
        queue.push(&second, None).await.unwrap();
        queue.push(&first, None).await.unwrap();

        let pulled = queue.pull("kokoro", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(pulled.job.job_id, first.job_id);
    }

    #[tokio::test]
    async fn pull_on_empty_queue_returns_none() {
        let queue = FakeQueue::new();
        assert!(queue.pull("kokoro", Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inflight_lock_is_exclusive() {
        let queue = FakeQueue::new();
        let fp = Fingerprint::from_hex("abc123");
        assert!(queue.acquire_inflight_lock(&fp).await.unwrap());
        assert!(!queue.acquire_inflight_lock(&fp).await.unwrap());
        queue.release_inflight_lock(&fp).await.unwrap();
        assert!(queue.acquire_inflight_lock(&fp).await.unwrap());
    }

    #[tokio::test]
    async fn evict_job_removes_from_queue_and_index() {
        let queue = FakeQueue::new();
        let j = job(Uuid::new_v4(), "kokoro", 100);
        let field = crate::keys::index_field(&j.user_id.to_string(), &j.document_id.to_string(), j.block_index);
        queue.push(&j, Some(&field)).await.unwrap();

        let evicted = queue.evict_job(j.user_id, j.document_id, j.block_index).await.unwrap();
        assert!(evicted);
        assert!(queue.pull("kokoro", Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_allows_up_to_the_limit_then_denies() {
        let queue = FakeQueue::new();
        let user = Uuid::new_v4();
        for _ in 0..300 {
            assert!(queue.check_rate_limit(user, 300).await.unwrap());
        }
        assert!(!queue.check_rate_limit(user, 300).await.unwrap());
    }

    #[tokio::test]
    async fn leader_lock_is_exclusive() {
        let queue = FakeQueue::new();
        assert!(queue.acquire_leader_lock("visibility-scanner", Duration::from_secs(15)).await.unwrap());
        assert!(!queue.acquire_leader_lock("visibility-scanner", Duration::from_secs(15)).await.unwrap());
    }

    #[tokio::test]
    async fn track_processing_stamps_the_current_time_not_the_queued_time() {
        let queue = FakeQueue::new();
        let stale_queued_at = Utc::now().timestamp_millis() - 60_000;
        let j = job(Uuid::new_v4(), "kokoro", stale_queued_at);

        let before = Utc::now().timestamp_millis();
        queue
            .track_processing("worker-1", &j, "tts:queue:kokoro", "tts:dlq:kokoro")
            .await
            .unwrap();
        let after = Utc::now().timestamp_millis();

        let entries = queue.scan_processing_entries().await.unwrap();
        let (_worker, jobs) = entries.into_iter().find(|(w, _)| w == "worker-1").unwrap();
        let (_job_id, entry) = jobs.into_iter().find(|(id, _)| *id == j.job_id).unwrap();
        assert!(entry.processing_started_ms >= before && entry.processing_started_ms <= after);
        assert_ne!(entry.processing_started_ms, stale_queued_at);
    }

    #[tokio::test]
    async fn requeue_refreshes_the_queued_at_score() {
        let queue = FakeQueue::new();
        let stale_queued_at = Utc::now().timestamp_millis() - 60_000;
        let mut j = job(Uuid::new_v4(), "kokoro", stale_queued_at);
        j.retry_count = 1;

        queue.requeue(&j).await.unwrap();

        let pulled = queue.pull("kokoro", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(pulled.job.job_id, j.job_id);
        assert!(pulled.job.queued_at_ms > stale_queued_at);
    }

    #[tokio::test]
    async fn move_failure_to_dlq_records_an_entry() {
        let queue = FakeQueue::new();
        let record = FailureRecord {
            job_id: Uuid::new_v4(),
            fingerprint: "abc123".to_string(),
            user_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            block_index: 0,
            model_slug: "kokoro".to_string(),
            reason: "cache write failed after retries".to_string(),
            moved_at_ms: Utc::now().timestamp_millis(),
        };

        queue.move_failure_to_dlq("kokoro", &record).await.unwrap();
        assert_eq!(queue.dlq_len("kokoro"), 1);
    }
}
