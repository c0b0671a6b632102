// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Audio Cache: a content-addressed byte store with size-bounded LRU
//! eviction and pin protection.

pub mod cache;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use cache::{Cache, CacheConfig, CacheStats, SqliteCache};
pub use error::CacheError;
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeCache;
