// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type for registry, waterfall and reservation operations.

use thiserror::Error;

/// Errors raised by `tts-registry`.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying Postgres error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON (de)serialization error, e.g. decoding stored parameters.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// A usage request would exceed the user's available balance.
    #[error("usage limit exceeded: requested {requested}, available {available}")]
    UsageLimitExceeded {
        /// Characters requested.
        requested: i64,
        /// Characters available after subtracting pending reservations.
        available: i64,
    },
    /// No usage period exists and one could not be created.
    #[error("no usage period for user")]
    NoUsagePeriod,
}
