// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Result Consumer (spec §4.5): drains worker results, finalizes
//! variants, bills usage, and notifies subscribers.
//!
//! Grounded on the drain-loop shape of `yapit/gateway/cache_persister.py`
//! (`BRPOP` then process) and the background-notifier shape of
//! `yapit/gateway/updater.py::run_updater`, adapted from a Redis pubsub
//! listener to the in-process [`crate::hub::Hub`].

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tts_dispatch::PlanResolver;
use tts_protocol::{BlockStatus, ServerMessage, WorkerOutcome, WorkerResult};
use tts_queue::{FailureRecord, Queue};
use tts_registry::{UsageLedger, VariantRegistry};

use crate::plan::StaticPlanResolver;
use crate::state::AppState;

const PULL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded attempts for the cache-store call before a result is
/// considered unrecoverable; matches the Visibility Scanner's
/// `MAX_RETRIES` order of magnitude for a single in-process operation.
const CACHE_STORE_ATTEMPTS: u32 = 3;
const CACHE_STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Run forever, draining the results list and finalizing each entry.
pub async fn run(state: Arc<AppState>) {
    tracing::info!("result_consumer starting");
    loop {
        match state.queue.pull_result(PULL_TIMEOUT).await {
            Ok(Some(result)) => finalize(&state, result).await,
            Ok(None) => {}
            Err(err) => {
                tracing::error!(%err, "result_consumer pull failed");
            }
        }
    }
}

async fn finalize(state: &Arc<AppState>, result: WorkerResult) {
    match &result.outcome {
        WorkerOutcome::Failure { error } => {
            notify_all(state, &result, ServerMessage::block_error(
                result.document_id,
                result.block_index,
                error.clone(),
            ))
            .await;
            let _ = state.queue.release_inflight_lock(&result.fingerprint).await;
            tracing::info!(fingerprint = %result.fingerprint, error, "synthesis_error");
            return;
        }
        WorkerOutcome::Success { audio_base64, .. } if audio_base64.is_empty() => {
            notify_all(
                state,
                &result,
                ServerMessage::status(result.document_id, result.block_index, BlockStatus::Skipped),
            )
            .await;
            let _ = state.queue.release_inflight_lock(&result.fingerprint).await;
            tracing::info!(fingerprint = %result.fingerprint, "synthesis_skipped");
            return;
        }
        WorkerOutcome::Success { .. } => {}
    }

    let WorkerOutcome::Success { audio_base64, duration_ms } = &result.outcome else {
        return;
    };

    let audio = match BASE64.decode(audio_base64) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(%err, fingerprint = %result.fingerprint, "malformed audio_base64, cannot retry");
            escalate_to_dlq(state, &result, format!("malformed audio_base64: {err}")).await;
            return;
        }
    };

    let cache_ref = result.fingerprint.as_str().to_string();
    if let Err(err) = store_with_retries(state, &cache_ref, &audio).await {
        tracing::error!(%err, fingerprint = %result.fingerprint, "cache store failed after retries");
        escalate_to_dlq(state, &result, format!("cache store failed: {err}")).await;
        return;
    }

    if let Err(err) = state
        .registry
        .as_ref()
        .set_cache_ref(&result.fingerprint, &cache_ref, i64::try_from(*duration_ms).unwrap_or(i64::MAX))
        .await
    {
        tracing::error!(%err, fingerprint = %result.fingerprint, "variant update failed");
    }

    bill_usage(&state.ledger, &state.plans, &result).await;

    tracing::info!(
        fingerprint = %result.fingerprint,
        worker_id = %result.worker_id,
        processing_time_ms = result.processing_time_ms,
        queue_wait_ms = result.queue_wait_ms,
        "synthesis_complete"
    );

    let audio_url = format!("/v1/audio/{}", result.fingerprint);
    notify_all(
        state,
        &result,
        ServerMessage::cached(result.document_id, result.block_index, audio_url),
    )
    .await;

    let _ = state.queue.release_inflight_lock(&result.fingerprint).await;
}

/// Billing is best-effort: a failure here is logged and swallowed rather
/// than blocking finalization, since a dangling un-billed synthesis is
/// reconciled by subsequent cache-hit requests and operational audits
/// (spec §4.5 step 5's crash-tolerance note), never by retrying the bill.
async fn bill_usage(
    ledger: &Arc<impl UsageLedger>,
    plans: &Arc<StaticPlanResolver>,
    result: &WorkerResult,
) {
    let amount = (f64::from(result.text_length) * result.usage_multiplier).round() as i64;
    if amount <= 0 {
        return;
    }
    let Ok(plan) = plans.effective_plan(result.user_id).await else {
        tracing::error!(user_id = %result.user_id, "plan resolution failed, skipping billing");
        return;
    };
    if let Err(err) = ledger.record_usage(result.user_id, &plan, amount, Utc::now()).await {
        tracing::error!(%err, user_id = %result.user_id, "usage billing failed");
    }
}

async fn notify_all(state: &Arc<AppState>, result: &WorkerResult, message: ServerMessage) {
    let subscribers = match state.queue.take_subscribers(&result.fingerprint).await {
        Ok(subscribers) => subscribers,
        Err(err) => {
            tracing::error!(%err, fingerprint = %result.fingerprint, "take_subscribers failed");
            return;
        }
    };
    for entry in subscribers {
        state.hub.lock().expect("hub lock poisoned").publish(
            entry.user_id,
            entry.document_id,
            &message,
        );
        let _ = state
            .queue
            .remove_pending(entry.user_id, entry.document_id, entry.block_index)
            .await;
    }
}

/// Retry a transient cache-store failure a few times in place before
/// giving up; most failures here are a momentarily unreachable cache
/// backend rather than a malformed input, so a short retry clears them
/// without paying the cost of a full requeue.
async fn store_with_retries(
    state: &Arc<AppState>,
    cache_ref: &str,
    audio: &[u8],
) -> Result<(), tts_cache::CacheError> {
    let mut last_err = None;
    for attempt in 0..CACHE_STORE_ATTEMPTS {
        match state.cache.as_ref().store(cache_ref, audio).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(%err, attempt, cache_ref, "cache store attempt failed");
                last_err = Some(err);
                tokio::time::sleep(CACHE_STORE_RETRY_DELAY).await;
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

/// Record a result that cannot be finalized as a dead-letter entry and
/// notify subscribers of the terminal failure.
///
/// Unlike the Visibility Scanner's reclaim path, this runs against a
/// [`WorkerResult`], not a [`tts_protocol::SynthesisJob`]: the wire
/// protocol only echoes enough of the job to bill and notify (it drops
/// `text`, `parameters`, and `codec`), and by the time a result reaches
/// here the worker's own `complete_processing` call has already cleared
/// the processing-hash entry that held the full job body. There is
/// nothing left to reconstruct a resubmittable `SynthesisJob` from, so a
/// failure discovered at this stage cannot be requeued for another
/// synthesis attempt — it goes straight to the dead-letter list instead
/// of the retry-then-DLQ path `Queue::requeue`/`move_to_dlq` give jobs
/// that are still in flight.
async fn escalate_to_dlq(state: &Arc<AppState>, result: &WorkerResult, reason: String) {
    let record = FailureRecord {
        job_id: result.job_id,
        fingerprint: result.fingerprint.as_str().to_string(),
        user_id: result.user_id,
        document_id: result.document_id,
        block_index: result.block_index,
        model_slug: result.model_slug.clone(),
        reason: reason.clone(),
        moved_at_ms: Utc::now().timestamp_millis(),
    };
    if let Err(err) = state.queue.move_failure_to_dlq(&result.model_slug, &record).await {
        tracing::error!(%err, fingerprint = %result.fingerprint, "failed to move result to dead-letter queue");
    }

    notify_all(
        state,
        result,
        ServerMessage::block_error(result.document_id, result.block_index, reason),
    )
    .await;
    let _ = state.queue.release_inflight_lock(&result.fingerprint).await;
}
