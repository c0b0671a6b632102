// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Redis-backed Queue Protocol: per-model work queues, processing
//! sets, the job index, results list, dead-letter list, in-flight lock,
//! subscriber/pending sets, and the rate limiter.

pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod keys;
pub mod queue;
pub mod types;

pub use error::QueueError;
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeQueue;
pub use queue::{Queue, RedisQueue};
pub use types::{FailureRecord, ProcessingEntry, PulledJob, SubscriberEntry};
