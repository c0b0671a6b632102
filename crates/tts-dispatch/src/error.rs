// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type for dispatch operations.

use thiserror::Error;
use tts_cache::CacheError;
use tts_queue::QueueError;
use tts_registry::RegistryError;

/// Errors raised by `tts-dispatch`.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Variant or usage-ledger persistence failed; fatal for this request
    /// per spec §4.1 ("Persistence errors during variant creation are
    /// fatal for the request").
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    /// Queue transport failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    /// Cache transport failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}
