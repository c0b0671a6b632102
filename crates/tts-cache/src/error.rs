// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type for cache operations.

use thiserror::Error;

/// Errors raised by `tts-cache`.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
