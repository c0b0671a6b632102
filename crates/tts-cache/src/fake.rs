// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! An in-memory `Cache` for unit tests, implementing the same LRU +
//! pin-protection eviction policy as `SqliteCache`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cache::{Cache, CacheConfig, CacheStats};
use crate::error::CacheError;

struct Entry {
    data: Vec<u8>,
    last_accessed: i64,
    pinned: bool,
}

struct State {
    entries: HashMap<String, Entry>,
    clock: i64,
}

/// In-memory `Cache` behind a mutex.
pub struct FakeCache {
    state: Mutex<State>,
    config: CacheConfig,
}

impl FakeCache {
    /// A new cache with the given size budget.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                clock: 0,
            }),
            config,
        }
    }

    fn enforce_max_size(state: &mut State, max_size_bytes: i64) {
        let total: i64 = state.entries.values().map(|e| e.data.len() as i64).sum();
        if total <= max_size_bytes {
            return;
        }
        let mut over_budget = total - max_size_bytes;
        let mut candidates: Vec<(String, i64, i64)> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned)
            .map(|(k, e)| (k.clone(), e.last_accessed, e.data.len() as i64))
            .collect();
        candidates.sort_by_key(|(_, last_accessed, _)| *last_accessed);

        for (key, _, size) in candidates {
            if over_budget <= 0 {
                break;
            }
            state.entries.remove(&key);
            over_budget -= size;
        }
    }
}

#[async_trait]
impl Cache for FakeCache {
    async fn store(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.clock += 1;
        let clock = state.clock;
        state.entries.insert(
            key.to_string(),
            Entry {
                data: data.to_vec(),
                last_accessed: clock,
                pinned: false,
            },
        );
        Self::enforce_max_size(&mut state, self.config.max_size_bytes);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.clock += 1;
        let clock = state.clock;
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_accessed = clock;
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.state.lock().expect("lock poisoned").entries.contains_key(key))
    }

    async fn batch_exists(&self, keys: &[String]) -> Result<HashSet<String>, CacheError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(keys.iter().filter(|k| state.entries.contains_key(*k)).cloned().collect())
    }

    async fn pin(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut state = self.state.lock().expect("lock poisoned");
        for key in keys {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.pinned = true;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.state.lock().expect("lock poisoned").entries.remove(key);
        Ok(())
    }

    async fn vacuum_if_needed(&self) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(CacheStats {
            total_size_bytes: state.entries.values().map(|e| e.data.len() as i64).sum(),
            entry_count: state.entries.len() as i64,
            pinned_count: state.entries.values().filter(|e| e.pinned).count() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn store_then_retrieve_round_trips_within_budget() {
        let cache = FakeCache::new(CacheConfig {
            max_size_bytes: 1024,
            ..CacheConfig::default()
        });
        cache.store("k1", b"hello").await.unwrap();
        assert_eq!(cache.retrieve("k1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn pinned_entries_survive_eviction() {
        let cache = FakeCache::new(CacheConfig {
            max_size_bytes: 10,
            ..CacheConfig::default()
        });
        cache.store("k1", b"hello").await.unwrap();
        cache.pin(&["k1".to_string()]).await.unwrap();
        cache.store("k2", b"0123456789xxxxxx").await.unwrap();
        assert_eq!(cache.retrieve("k1").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_accessed_unpinned_entry_first() {
        let cache = FakeCache::new(CacheConfig {
            max_size_bytes: 10,
            ..CacheConfig::default()
        });
        cache.store("old", b"01234").await.unwrap();
        cache.store("new", b"56789").await.unwrap();
        // Touch "old" so "new" becomes the least recently accessed.
        cache.retrieve("old").await.unwrap();
        cache.store("third", b"abcde").await.unwrap();
        assert!(cache.exists("old").await.unwrap());
        assert!(!cache.exists("new").await.unwrap());
    }

    #[tokio::test]
    async fn batch_exists_reports_only_present_keys() {
        let cache = FakeCache::new(CacheConfig::default());
        cache.store("k1", b"x").await.unwrap();
        let present = cache
            .batch_exists(&["k1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(present.contains("k1"));
        assert!(!present.contains("missing"));
    }
}
