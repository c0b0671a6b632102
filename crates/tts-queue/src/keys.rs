// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Redis key naming. Every name here matches the persisted-state-keys table
//! in the design doc verbatim so an operator inspecting Redis with `redis-cli
//! KEYS` recognizes the same shapes the original service used.

/// Sorted-set work queue for one model.
pub fn queue_key(model_slug: &str) -> String {
    format!("tts:queue:{model_slug}")
}

/// Hash of `job_id -> wrapper JSON`, shared across all models.
pub const JOBS_HASH: &str = "tts:jobs";

/// Hash of `"user:doc:block" -> job_id`, enabling O(1) cursor eviction.
pub const JOB_INDEX_HASH: &str = "tts:job_index";

/// Per-worker processing hash: `job_id -> processing entry`.
pub fn processing_key(worker_id: &str) -> String {
    format!("tts:processing:{worker_id}")
}

/// Glob pattern matching every worker's processing hash, for the
/// Visibility Scanner's key-pattern discovery.
pub const PROCESSING_PATTERN: &str = "tts:processing:*";

/// List of pending `WorkerResult` JSON bodies.
pub const RESULTS_LIST: &str = "tts:results";

/// Dead-letter list for one model.
pub fn dlq_key(model_slug: &str) -> String {
    format!("tts:dlq:{model_slug}")
}

/// TTL applied to a DLQ entry's containing list key on every push.
pub const DLQ_TTL_SECONDS: i64 = 7 * 24 * 3600;

/// In-flight deduplication lock for a fingerprint.
pub fn inflight_key(fingerprint: &str) -> String {
    format!("tts:inflight:{fingerprint}")
}

/// TTL applied to the in-flight lock: worst-case queue-wait + processing +
/// retries.
pub const INFLIGHT_TTL_SECONDS: i64 = 200;

/// Subscriber set for a fingerprint.
pub fn subscribers_key(fingerprint: &str) -> String {
    format!("tts:subscribers:{fingerprint}")
}

/// TTL applied to subscriber and pending sets.
pub const SUBSCRIBER_TTL_SECONDS: i64 = 600;

/// Pending-set for a (user, document) pair.
pub fn pending_key(user_id: &str, document_id: &str) -> String {
    format!("tts:pending:{user_id}:{document_id}")
}

/// Per-user rate-limit counter.
pub fn ratelimit_key(user_id: &str) -> String {
    format!("ratelimit:tts:{user_id}")
}

/// Window over which the rate limit counter is tallied.
pub const RATELIMIT_WINDOW_SECONDS: i64 = 60;

/// Build the `"user:doc:block"` index key used in [`JOB_INDEX_HASH`].
pub fn index_field(user_id: &str, document_id: &str, block_index: u32) -> String {
    format!("{user_id}:{document_id}:{block_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers_produce_the_documented_shapes() {
        assert_eq!(queue_key("kokoro"), "tts:queue:kokoro");
        assert_eq!(processing_key("worker-1"), "tts:processing:worker-1");
        assert_eq!(dlq_key("kokoro"), "tts:dlq:kokoro");
        assert_eq!(inflight_key("abc123"), "tts:inflight:abc123");
        assert_eq!(subscribers_key("abc123"), "tts:subscribers:abc123");
        assert_eq!(pending_key("u1", "d1"), "tts:pending:u1:d1");
        assert_eq!(ratelimit_key("u1"), "ratelimit:tts:u1");
        assert_eq!(index_field("u1", "d1", 7), "u1:d1:7");
    }
}
