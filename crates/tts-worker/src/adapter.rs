// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-engine synthesis port, grounded on
//! `yapit/workers/processors/base.py::SynthAdapter`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkerError;

/// One synthesis engine (local model or remote API). Implementations are
/// injected into the runner loops so the queue/retry plumbing stays
/// engine-agnostic.
#[async_trait]
pub trait SynthAdapter: Send + Sync {
    /// One-time setup (load model weights, warm a connection pool, ...).
    /// Called once before the runner loop starts pulling jobs.
    async fn initialize(&self) -> Result<(), WorkerError>;

    /// Synthesize `text` into raw audio bytes in the job's requested codec.
    async fn synthesize(
        &self,
        text: &str,
        voice_slug: &str,
        parameters: &Value,
    ) -> Result<Vec<u8>, WorkerError>;

    /// Compute the audio duration, in milliseconds, of a buffer this
    /// adapter produced.
    fn calculate_duration_ms(&self, audio: &[u8]) -> u64;
}
