// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Visibility Scanner (spec §4.6), grounded verbatim on
//! `yapit/gateway/visibility_scanner.py::run_visibility_scanner`.
//!
//! Leader-elected so that running multiple gateway replicas does not
//! double-requeue a stuck job; the original assumed a single scanner
//! process instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tts_protocol::ServerMessage;
use tts_queue::Queue;

use crate::state::AppState;

const VISIBILITY_TIMEOUT_MS: i64 = 30_000;
const MAX_RETRIES: u32 = 3;
const SCAN_INTERVAL: Duration = Duration::from_secs(15);
const LEADER_LOCK_TTL: Duration = Duration::from_secs(20);

/// Run forever, sweeping every worker's processing hash for stuck jobs.
pub async fn run(state: Arc<AppState>) {
    tracing::info!("visibility_scanner starting");
    loop {
        tokio::time::sleep(SCAN_INTERVAL).await;

        match state.queue.acquire_leader_lock("visibility_scanner", LEADER_LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                tracing::error!(%err, "leader lock acquisition failed");
                continue;
            }
        }

        if let Err(err) = scan(&state).await {
            tracing::error!(%err, "visibility scan failed");
        }
    }
}

async fn scan(state: &Arc<AppState>) -> Result<(), tts_queue::QueueError> {
    let now_ms = Utc::now().timestamp_millis();
    let worker_sets = state.queue.scan_processing_entries().await?;

    for (worker_id, entries) in worker_sets {
        for (job_id, entry) in entries {
            let age_ms = now_ms - entry.processing_started_ms;
            if age_ms < VISIBILITY_TIMEOUT_MS {
                continue;
            }

            tracing::warn!(%job_id, worker_id, age_ms, retry_count = entry.job.retry_count, "job stuck, reclaiming");
            state.queue.complete_processing(&worker_id, job_id).await?;

            if entry.job.retry_count >= MAX_RETRIES {
                state.queue.move_to_dlq(&entry.job.model_slug, &entry.job).await?;
                let _ = state.queue.release_inflight_lock(&entry.job.fingerprint).await;

                let subscribers = state.queue.take_subscribers(&entry.job.fingerprint).await?;
                let message = ServerMessage::block_error(
                    entry.job.document_id,
                    entry.job.block_index,
                    "synthesis failed after repeated worker timeouts".to_string(),
                );
                for subscriber in subscribers {
                    state
                        .hub
                        .lock()
                        .expect("hub lock poisoned")
                        .publish(subscriber.user_id, subscriber.document_id, &message);
                    let _ = state
                        .queue
                        .remove_pending(subscriber.user_id, subscriber.document_id, subscriber.block_index)
                        .await;
                }
                tracing::error!(job_id = %entry.job.job_id, "job moved to dead-letter queue after max retries");
            } else {
                let mut retried = entry.job.clone();
                retried.retry_count += 1;
                state.queue.requeue(&retried).await?;
                // Subscriber set and in-flight lock are left untouched: the
                // requeued job will be pulled and finalized like any other,
                // notifying the same waiting subscribers on completion.
                tracing::info!(job_id = %entry.job.job_id, retry_count = retried.retry_count, "job requeued");
            }
        }
    }

    Ok(())
}
