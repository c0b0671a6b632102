// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type for adapter and runner operations.

use thiserror::Error;
use tts_queue::QueueError;

/// Errors raised by `tts-worker`.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Queue transport failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    /// The adapter failed to synthesize the requested text.
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}
