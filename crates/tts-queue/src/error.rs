// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type for queue operations.

use thiserror::Error;

/// Errors raised by `tts-queue`.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying Redis transport or command error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// A job or result body failed to (de)serialize.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
