// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Queue payloads and WebSocket wire messages.
//!
//! Grounded on `yapit/contracts.py`'s `SynthesisJob`, `yapit/workers/queue.py`'s
//! `PulledJob`/result shape, and `yapit/gateway/api/v1/ws.py`'s request/notify
//! payloads. Field names and JSON shapes follow the wire format unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// A document identifier.
pub type DocumentId = Uuid;

/// A user identifier.
pub type UserId = Uuid;

/// Requested synthesis mode: whether the caller pays from the usage
/// waterfall (`Server`) or is only warming a client-side cache (`Browser`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    /// Client-side synthesis; does not consume the usage waterfall.
    Browser,
    /// Server-side synthesis; consumes the requesting user's usage waterfall.
    Server,
}

/// A queued unit of synthesis work, as pushed onto the Redis queue and
/// pulled by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisJob {
    /// Unique id for this particular queue entry (not the fingerprint).
    pub job_id: Uuid,
    /// Content fingerprint; the dedup and cache key.
    pub fingerprint: Fingerprint,
    /// Requesting user.
    pub user_id: UserId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Index of the block within the document.
    pub block_index: u32,
    /// Model slug, e.g. `"kokoro"`.
    pub model_slug: String,
    /// Voice slug, e.g. `"af_heart"`.
    pub voice_slug: String,
    /// Free-form synthesis parameters (speed, pitch, ...).
    pub parameters: Value,
    /// Block text to synthesize.
    pub text: String,
    /// Output codec, e.g. `"opus"`.
    pub codec: String,
    /// Number of times this job has been requeued after a visibility timeout.
    pub retry_count: u32,
    /// Unix millis when this job was first queued.
    pub queued_at_ms: i64,
}

/// The result a worker reports after finishing (or failing) a job.
///
/// Mirrors spec.md §6's worker result JSON verbatim, including the
/// `block_idx` (not `block_index`) field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Echoes the originating job's id.
    pub job_id: Uuid,
    /// Echoes the originating job's fingerprint.
    pub fingerprint: Fingerprint,
    /// Echoes the originating job's user.
    pub user_id: UserId,
    /// Echoes the originating job's document.
    pub document_id: DocumentId,
    /// Echoes the originating job's block index.
    #[serde(rename = "block_idx")]
    pub block_index: u32,
    /// Echoes the originating job's model slug.
    pub model_slug: String,
    /// Echoes the originating job's voice slug.
    pub voice_slug: String,
    /// Length of the synthesized text, used for usage accounting.
    pub text_length: u32,
    /// Billing multiplier applied for this model/voice combination.
    pub usage_multiplier: f64,
    /// Id of the worker that produced this result.
    pub worker_id: String,
    /// Wall-clock synthesis time, in milliseconds.
    pub processing_time_ms: u64,
    /// Time spent queued before a worker picked the job up, in milliseconds.
    pub queue_wait_ms: u64,
    /// The outcome: success with audio, or failure with an error message.
    /// An empty `audio_base64` (zero-length, present) signals `skipped`,
    /// matching the Result Consumer's interpretation in spec.md §4.5 step 2.
    #[serde(flatten)]
    pub outcome: WorkerOutcome,
}

/// A worker's synthesis outcome: success (possibly empty, meaning
/// `skipped`), or a hard failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerOutcome {
    /// Synthesis succeeded (or was voluntarily skipped, see `is_skipped`).
    Success {
        /// Base64-encoded audio bytes in the job's requested codec. Empty
        /// when the worker found the block no longer pending (eviction
        /// raced with pull) and skipped the work.
        audio_base64: String,
        /// Audio duration in milliseconds.
        duration_ms: u64,
    },
    /// Synthesis failed; `error` is a human-readable message.
    Failure {
        /// Human-readable failure reason.
        error: String,
    },
}

impl WorkerOutcome {
    /// True when this is a voluntary skip rather than real audio.
    ///
    /// A worker that pulled a job for a block the user has since scrolled
    /// past (see the Cursor-Window Evictor's critical subtlety in spec.md
    /// §4.7) posts success with empty audio rather than failing the job.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Success { audio_base64, .. } if audio_base64.is_empty())
    }
}

/// Messages a client may send over the `/v1/ws/tts` WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request synthesis of one or more blocks.
    Synthesize {
        /// Document the blocks belong to.
        document_id: DocumentId,
        /// Indices of the blocks to synthesize.
        block_indices: Vec<u32>,
        /// The user's current cursor position, used to seed the pending-set
        /// buffer window.
        cursor: i64,
        /// Model slug to synthesize with.
        model: String,
        /// Voice slug to synthesize with.
        voice: String,
        /// Whether this request consumes the server usage waterfall.
        synthesis_mode: SynthesisMode,
    },
    /// Notify the server that the reading cursor moved, updating the
    /// client's eviction window.
    CursorMoved {
        /// Document whose cursor moved.
        document_id: DocumentId,
        /// New cursor block index.
        cursor: i64,
    },
}

/// Terminal or transient status of a single block's synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Queued, awaiting a worker.
    Queued,
    /// A worker has claimed the job and is synthesizing it.
    Processing,
    /// Audio is available in the cache; `audio_url` is set.
    Cached,
    /// The worker found the block no longer pending and skipped it.
    Skipped,
    /// Synthesis failed and will not be retried further; `error` is set.
    Error,
}

/// Messages the server may push over the `/v1/ws/tts` WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A block's synthesis status changed.
    Status {
        /// Document the block belongs to.
        document_id: DocumentId,
        /// Block index within the document.
        #[serde(rename = "block_idx")]
        block_index: u32,
        /// Current lifecycle state.
        status: BlockStatus,
        /// Present when `status == "cached"`.
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        /// Present when `status == "error"`.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Present when the status carries model/voice context.
        #[serde(skip_serializing_if = "Option::is_none")]
        model_slug: Option<String>,
        /// Present when the status carries model/voice context.
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_slug: Option<String>,
    },
    /// Blocks were evicted from the client's buffer window.
    Evicted {
        /// Document the blocks belong to.
        document_id: DocumentId,
        /// Block indices that were evicted.
        block_indices: Vec<u32>,
    },
    /// An error occurred while processing a client message (validation,
    /// quota, or rate limit), not tied to a specific block.
    Error {
        /// Human-readable error message.
        error: String,
    },
}

impl ServerMessage {
    /// Build a bare `status` message with no audio/error/model context.
    pub fn status(document_id: DocumentId, block_index: u32, status: BlockStatus) -> Self {
        Self::Status {
            document_id,
            block_index,
            status,
            audio_url: None,
            error: None,
            model_slug: None,
            voice_slug: None,
        }
    }

    /// Build a `status: cached` message carrying the audio URL.
    pub fn cached(document_id: DocumentId, block_index: u32, audio_url: impl Into<String>) -> Self {
        Self::Status {
            document_id,
            block_index,
            status: BlockStatus::Cached,
            audio_url: Some(audio_url.into()),
            error: None,
            model_slug: None,
            voice_slug: None,
        }
    }

    /// Build a `status: error` message carrying the failure reason.
    pub fn block_error(document_id: DocumentId, block_index: u32, error: impl Into<String>) -> Self {
        Self::Status {
            document_id,
            block_index,
            status: BlockStatus::Error,
            audio_url: None,
            error: Some(error.into()),
            model_slug: None,
            voice_slug: None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn client_synthesize_message_matches_wire_shape() {
        let msg = ClientMessage::Synthesize {
            document_id: Uuid::nil(),
            block_indices: vec![0, 1, 2],
            cursor: 0,
            model: "kokoro".into(),
            voice: "af_heart".into(),
            synthesis_mode: SynthesisMode::Server,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("synthesize"));
        assert_eq!(value["block_indices"], json!([0, 1, 2]));
        assert_eq!(value["synthesis_mode"], json!("server"));
    }

    #[test]
    fn client_cursor_moved_message_matches_wire_shape() {
        let msg = ClientMessage::CursorMoved {
            document_id: Uuid::nil(),
            cursor: 30,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("cursor_moved"));
        assert_eq!(value["cursor"], json!(30));
    }

    #[test]
    fn server_cached_status_carries_block_idx_and_audio_url() {
        let msg = ServerMessage::cached(Uuid::nil(), 7, "/v1/audio/abc123");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("status"));
        assert_eq!(value["block_idx"], json!(7));
        assert_eq!(value["status"], json!("cached"));
        assert_eq!(value["audio_url"], json!("/v1/audio/abc123"));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn server_error_status_round_trips() {
        let msg = ServerMessage::block_error(Uuid::nil(), 2, "synthesis failed");
        let value = serde_json::to_value(&msg).unwrap();
        let back: ServerMessage = serde_json::from_value(value).unwrap();
        match back {
            ServerMessage::Status { status, error, .. } => {
                assert_eq!(status, BlockStatus::Error);
                assert_eq!(error.as_deref(), Some("synthesis failed"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn top_level_error_message_matches_wire_shape() {
        let msg = ServerMessage::Error {
            error: "Rate limit exceeded. Please slow down.".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("error"));
        assert_eq!(value["error"], json!("Rate limit exceeded. Please slow down."));
    }

    #[test]
    fn worker_result_success_outcome_flattens_into_top_level_fields() {
        let result = WorkerResult {
            job_id: Uuid::nil(),
            fingerprint: Fingerprint::from_hex("abc123"),
            user_id: Uuid::nil(),
            document_id: Uuid::nil(),
            block_index: 0,
            model_slug: "kokoro".into(),
            voice_slug: "af_heart".into(),
            text_length: 42,
            usage_multiplier: 1.0,
            worker_id: "worker-1".into(),
            processing_time_ms: 120,
            queue_wait_ms: 30,
            outcome: WorkerOutcome::Success {
                audio_base64: "AAAA".into(),
                duration_ms: 900,
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["audio_base64"], json!("AAAA"));
        assert_eq!(value["duration_ms"], json!(900));
        assert_eq!(value["block_idx"], json!(0));
        assert!(value.get("block_index").is_none());
    }

    #[test]
    fn empty_audio_outcome_is_skipped() {
        let outcome = WorkerOutcome::Success {
            audio_base64: String::new(),
            duration_ms: 0,
        };
        assert!(outcome.is_skipped());
    }
}
