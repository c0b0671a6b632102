// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runner loops over the Pull-Worker Contract (spec §4.4), grounded on
//! `yapit/workers/tts_loop.py::run_tts_worker`/`run_api_tts_dispatcher`.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tts_protocol::{SynthesisJob, WorkerOutcome, WorkerResult};
use tts_queue::{keys, Queue};

use crate::adapter::SynthAdapter;
use crate::error::WorkerError;

/// Static per-process identity and billing constant. Each worker process
/// serves exactly one model slug, mirroring the original `MODEL_SLUG`
/// environment-variable convention.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique id for this worker process (used as the processing-set key).
    pub worker_id: String,
    /// The model slug this worker pulls jobs for.
    pub model_slug: String,
    /// Billing multiplier applied to every job this worker completes.
    pub usage_multiplier: f64,
    /// How long `pull` blocks before returning `None` and looping again.
    pub pull_timeout: Duration,
}

/// Run the bounded, sequential pull loop for a GPU-style model: one job in
/// flight at a time, tracked in the processing set so the Visibility
/// Scanner can reclaim it on a crash. Runs until cancelled.
pub async fn run_tts_worker<Q, A>(
    queue: Arc<Q>,
    adapter: Arc<A>,
    config: WorkerConfig,
) -> Result<(), WorkerError>
where
    Q: Queue + 'static,
    A: SynthAdapter + 'static,
{
    let dlq_key = keys::dlq_key(&config.model_slug);
    adapter.initialize().await?;
    tracing::info!(worker_id = %config.worker_id, model_slug = %config.model_slug, "worker initialized");

    loop {
        let Some(pulled) = queue.pull(&config.model_slug, config.pull_timeout).await? else {
            continue;
        };
        let job = pulled.job;
        queue
            .track_processing(&config.worker_id, &job, &keys::queue_key(&config.model_slug), &dlq_key)
            .await?;

        let result = synthesize_one(queue.as_ref(), adapter.as_ref(), &job, &config).await;
        queue.push_result(&result).await?;
        queue.complete_processing(&config.worker_id, job.job_id).await?;
    }
}

/// Run the unbounded dispatcher for an API-backed model: spawn one task per
/// pulled job with no concurrency cap and no processing-set tracking. A
/// crash here silently drops in-flight jobs rather than stalling the pool
/// (spec §4.4's accepted trade-off for this adapter class).
pub async fn run_api_tts_dispatcher<Q, A>(
    queue: Arc<Q>,
    adapter: Arc<A>,
    config: WorkerConfig,
) -> Result<(), WorkerError>
where
    Q: Queue + 'static,
    A: SynthAdapter + 'static,
{
    adapter.initialize().await?;
    tracing::info!(worker_id = %config.worker_id, model_slug = %config.model_slug, "api dispatcher initialized");

    loop {
        let Some(pulled) = queue.pull(&config.model_slug, config.pull_timeout).await? else {
            continue;
        };
        let job = pulled.job;
        let queue = Arc::clone(&queue);
        let adapter = Arc::clone(&adapter);
        let config = config.clone();
        tokio::spawn(async move {
            let result = synthesize_one(queue.as_ref(), adapter.as_ref(), &job, &config).await;
            if let Err(err) = queue.push_result(&result).await {
                tracing::error!(?err, job_id = %job.job_id, "failed to post worker result");
            }
        });
    }
}

/// Synthesize one job and build its `WorkerResult`, honoring the
/// pending-set skip check (spec §4.7's critical subtlety) and never
/// returning an error: failures are encoded as a result so the caller can
/// always post one.
async fn synthesize_one<Q, A>(
    queue: &Q,
    adapter: &A,
    job: &SynthesisJob,
    config: &WorkerConfig,
) -> WorkerResult
where
    Q: Queue,
    A: SynthAdapter,
{
    let start = Utc::now();
    let queue_wait_ms = (start.timestamp_millis() - job.queued_at_ms).max(0) as u64;

    let outcome = if should_skip(queue, job).await {
        tracing::info!(job_id = %job.job_id, fingerprint = %job.fingerprint, "block no longer pending, skipping");
        WorkerOutcome::Success {
            audio_base64: String::new(),
            duration_ms: 0,
        }
    } else {
        match adapter.synthesize(&job.text, &job.voice_slug, &job.parameters).await {
            Ok(audio) => {
                let duration_ms = adapter.calculate_duration_ms(&audio);
                WorkerOutcome::Success {
                    audio_base64: BASE64.encode(audio),
                    duration_ms,
                }
            }
            Err(err) => WorkerOutcome::Failure {
                error: err.to_string(),
            },
        }
    };

    let processing_time_ms = (Utc::now() - start).num_milliseconds().max(0) as u64;

    WorkerResult {
        job_id: job.job_id,
        fingerprint: job.fingerprint.clone(),
        user_id: job.user_id,
        document_id: job.document_id,
        block_index: job.block_index,
        model_slug: job.model_slug.clone(),
        voice_slug: job.voice_slug.clone(),
        text_length: job.text.chars().count() as u32,
        usage_multiplier: config.usage_multiplier,
        worker_id: config.worker_id.clone(),
        processing_time_ms,
        queue_wait_ms,
        outcome,
    }
}

/// A job's pending-set may have been emptied by an eviction that raced with
/// `pull`. An untracked (REST-only) job never populates a pending-set at
/// all, so an empty set is read as "not tracked, proceed" rather than
/// "evicted"; the narrow race where the sole remaining tracked entry is
/// evicted in that same window is accepted (see DESIGN.md).
async fn should_skip<Q: Queue>(queue: &Q, job: &SynthesisJob) -> bool {
    match queue.pending_members(job.user_id, job.document_id).await {
        Ok(pending) if pending.is_empty() => false,
        Ok(pending) => !pending.contains(&job.block_index),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;
    use tts_protocol::Fingerprint;
    use tts_queue::FakeQueue;
    use uuid::Uuid;

    struct StubAdapter;

    #[async_trait::async_trait]
    impl SynthAdapter for StubAdapter {
        async fn initialize(&self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn synthesize(
            &self,
            text: &str,
            _voice_slug: &str,
            _parameters: &serde_json::Value,
        ) -> Result<Vec<u8>, WorkerError> {
            Ok(vec![0u8; text.len().max(1)])
        }

        fn calculate_duration_ms(&self, audio: &[u8]) -> u64 {
            audio.len() as u64
        }
    }

    fn job(user_id: Uuid, document_id: Uuid, block_index: u32) -> SynthesisJob {
        SynthesisJob {
            job_id: Uuid::new_v4(),
            fingerprint: Fingerprint::from_hex("abc123"),
            user_id,
            document_id,
            block_index,
            model_slug: "kokoro".into(),
            voice_slug: "af_heart".into(),
            parameters: json!({}),
            text: "Hello.".into(),
            codec: "opus".into(),
            retry_count: 0,
            queued_at_ms: Utc::now().timestamp_millis(),
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "worker-1".into(),
            model_slug: "kokoro".into(),
            usage_multiplier: 1.0,
            pull_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn untracked_job_is_synthesized_even_with_no_pending_set() {
        let queue = FakeQueue::new();
        let adapter = StubAdapter;
        let j = job(Uuid::new_v4(), Uuid::new_v4(), 0);

        let result = synthesize_one(&queue, &adapter, &j, &config()).await;
        assert!(!result.outcome.is_skipped());
    }

    #[tokio::test]
    async fn evicted_block_still_in_another_pending_entry_is_skipped() {
        let queue = FakeQueue::new();
        let adapter = StubAdapter;
        let user_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();
        // Another block from the same document is still pending, so the
        // set is non-empty and membership is meaningful.
        queue.add_pending(user_id, document_id, 99).await.unwrap();
        let j = job(user_id, document_id, 0);

        let result = synthesize_one(&queue, &adapter, &j, &config()).await;
        assert!(result.outcome.is_skipped());
    }

    #[tokio::test]
    async fn pending_block_is_synthesized() {
        let queue = FakeQueue::new();
        let adapter = StubAdapter;
        let user_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();
        queue.add_pending(user_id, document_id, 0).await.unwrap();
        let j = job(user_id, document_id, 0);

        let result = synthesize_one(&queue, &adapter, &j, &config()).await;
        assert!(!result.outcome.is_skipped());
    }
}
