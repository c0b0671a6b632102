// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transient types stored in Redis hashes/sets alongside a `SynthesisJob`.

use serde::{Deserialize, Serialize};
use tts_protocol::{DocumentId, SynthesisJob, UserId};
use uuid::Uuid;

/// A job body as pulled from the queue, paired with the key it was indexed
/// under (if it was tracked for WebSocket eviction).
#[derive(Debug, Clone)]
pub struct PulledJob {
    /// The job body.
    pub job: SynthesisJob,
    /// The `"user:doc:block"` index field this job was registered under, if
    /// the request was made with `track_for_websocket = true`.
    pub index_field: Option<String>,
}

/// The per-worker processing-hash entry written before synthesis begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEntry {
    /// Unix millis when this worker began processing the job.
    pub processing_started_ms: i64,
    /// Retry count carried over from the job body.
    pub retry_count: u32,
    /// The full job body, so a reclaim can requeue without re-fetching.
    pub job: SynthesisJob,
    /// Name of the model queue this job came from, so a reclaim knows
    /// where to push it back to.
    pub queue_name: String,
    /// Name of the DLQ this job goes to on retry exhaustion.
    pub dlq_key: String,
}

/// A dead-letter record for a failure discovered after the originating
/// job's own body has already been discarded, so it carries what is known
/// about the job rather than the job itself.
///
/// The Result Consumer only ever sees a `WorkerResult`; by the time one
/// arrives, the job's processing-hash entry (the only place retaining the
/// full `SynthesisJob`, including `text`/`parameters`/`codec`) has already
/// been cleared by the worker's `complete_processing` call, so a failure at
/// this stage cannot be resubmitted as a normal job the way the Visibility
/// Scanner's reclaim path can.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The originating job's id.
    pub job_id: Uuid,
    /// The originating job's fingerprint.
    pub fingerprint: String,
    /// The requesting user.
    pub user_id: UserId,
    /// The owning document.
    pub document_id: DocumentId,
    /// The block index within the document.
    pub block_index: u32,
    /// The model slug that was synthesizing this job.
    pub model_slug: String,
    /// Human-readable reason this result could not be finalized.
    pub reason: String,
    /// Unix millis when this record was written.
    pub moved_at_ms: i64,
}

/// One waiting `(user, document, block)` triple, notified when its
/// fingerprint's synthesis completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberEntry {
    /// The subscribing user.
    pub user_id: UserId,
    /// The document the block belongs to.
    pub document_id: DocumentId,
    /// The block index within the document.
    pub block_index: u32,
}
