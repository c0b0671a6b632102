// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A dependency-free `SynthAdapter` that produces silence, grounded on
//! `yapit/workers/processors/local.py::LocalProcessor`. Used by the demo
//! binary and integration tests in place of a real TTS engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::SynthAdapter;
use crate::error::WorkerError;

/// 16kHz, 16-bit, mono PCM: 32 bytes of audio per millisecond.
const BYTES_PER_MS: u64 = 32;
/// Rough speaking rate used to size the silent buffer.
const MS_PER_CHAR: u64 = 60;
/// Floor so even an empty block produces a playable clip.
const MIN_DURATION_MS: u64 = 200;

/// Produces silent PCM16 audio sized to the input text, standing in for a
/// real synthesis engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEchoAdapter;

impl LocalEchoAdapter {
    /// Construct the adapter. Stateless; `initialize` is a no-op.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SynthAdapter for LocalEchoAdapter {
    async fn initialize(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        _voice_slug: &str,
        _parameters: &Value,
    ) -> Result<Vec<u8>, WorkerError> {
        let duration_ms = (text.chars().count() as u64 * MS_PER_CHAR).max(MIN_DURATION_MS);
        Ok(vec![0u8; (duration_ms * BYTES_PER_MS) as usize])
    }

    fn calculate_duration_ms(&self, audio: &[u8]) -> u64 {
        audio.len() as u64 / BYTES_PER_MS
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn longer_text_produces_longer_audio() {
        let adapter = LocalEchoAdapter::new();
        let short = adapter.synthesize("Hi.", "af_heart", &json!({})).await.unwrap();
        let long = adapter
            .synthesize(&"Hello world. ".repeat(20), "af_heart", &json!({}))
            .await
            .unwrap();
        assert!(long.len() > short.len());
    }

    #[tokio::test]
    async fn empty_text_floors_at_the_minimum_duration() {
        let adapter = LocalEchoAdapter::new();
        let audio = adapter.synthesize("", "af_heart", &json!({})).await.unwrap();
        assert_eq!(adapter.calculate_duration_ms(&audio), MIN_DURATION_MS);
    }

    #[tokio::test]
    async fn duration_round_trips_through_the_byte_rate() {
        let adapter = LocalEchoAdapter::new();
        let audio = adapter
            .synthesize("The quick brown fox.", "af_heart", &json!({}))
            .await
            .unwrap();
        let duration = adapter.calculate_duration_ms(&audio);
        assert_eq!(audio.len() as u64, duration * BYTES_PER_MS);
    }
}
