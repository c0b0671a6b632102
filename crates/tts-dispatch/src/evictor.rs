// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Cursor-Window Evictor (spec §4.7), grounded on
//! `yapit/gateway/api/v1/ws.py::_handle_cursor_moved`.

use tts_protocol::{DocumentId, UserId};
use tts_queue::Queue;

use crate::error::DispatchError;

/// Default blocks retained behind the cursor.
pub const DEFAULT_BUFFER_BEHIND: i64 = 5;
/// Default blocks retained ahead of the cursor.
pub const DEFAULT_BUFFER_AHEAD: i64 = 10;

/// The retained window around a cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferWindow {
    /// Lowest retained block index (inclusive), saturating at zero.
    pub low: i64,
    /// Highest retained block index (inclusive).
    pub high: i64,
}

impl BufferWindow {
    /// Compute `[cursor - buffer_behind, cursor + buffer_ahead]`.
    pub fn around(cursor: i64, buffer_behind: i64, buffer_ahead: i64) -> Self {
        Self {
            low: (cursor - buffer_behind).max(0),
            high: cursor + buffer_ahead,
        }
    }

    /// Whether `block_index` falls outside this window.
    pub fn excludes(&self, block_index: u32) -> bool {
        let idx = i64::from(block_index);
        idx < self.low || idx > self.high
    }
}

/// On a `cursor_moved` notification, evict every pending block that falls
/// outside the retained window. Returns the sorted list of evicted block
/// indices (empty if none were evicted).
pub async fn evict_for_cursor(
    queue: &dyn Queue,
    user_id: UserId,
    document_id: DocumentId,
    cursor: i64,
    buffer_behind: i64,
    buffer_ahead: i64,
) -> Result<Vec<u32>, DispatchError> {
    let window = BufferWindow::around(cursor, buffer_behind, buffer_ahead);
    let pending = queue.pending_members(user_id, document_id).await?;

    let mut evicted = Vec::new();
    for block_index in pending {
        if !window.excludes(block_index) {
            continue;
        }
        queue
            .remove_pending(user_id, document_id, block_index)
            .await?;
        queue.evict_job(user_id, document_id, block_index).await?;
        evicted.push(block_index);
    }
    evicted.sort_unstable();

    if !evicted.is_empty() {
        tracing::info!(
            user_id = %user_id,
            document_id = %document_id,
            window_low = window.low,
            window_high = window.high,
            evicted = ?evicted,
            "eviction_triggered"
        );
    }

    Ok(evicted)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tts_queue::FakeQueue;

    #[test]
    fn window_around_zero_saturates_the_low_bound() {
        let window = BufferWindow::around(0, 5, 10);
        assert_eq!(window.low, 0);
        assert_eq!(window.high, 10);
        assert!(!window.excludes(10));
        assert!(window.excludes(11));
    }

    #[test]
    fn cursor_at_thirty_excludes_blocks_below_twenty_five() {
        let window = BufferWindow::around(30, 5, 10);
        assert_eq!(window.low, 25);
        assert_eq!(window.high, 40);
        for i in 0..=14u32 {
            assert!(window.excludes(i), "block {i} should be excluded");
        }
        assert!(!window.excludes(25));
    }

    #[tokio::test]
    async fn evicts_only_blocks_outside_the_window() {
        let queue = FakeQueue::new();
        let user_id = uuid::Uuid::new_v4();
        let document_id = uuid::Uuid::new_v4();
        for i in 0..20u32 {
            queue.add_pending(user_id, document_id, i).await.unwrap();
        }

        let evicted = evict_for_cursor(&queue, user_id, document_id, 30, 5, 10)
            .await
            .unwrap();
        assert_eq!(evicted, (0..=14).collect::<Vec<u32>>());

        let remaining = queue.pending_members(user_id, document_id).await.unwrap();
        assert_eq!(remaining.len(), 5);
        assert!((15..20).all(|i| remaining.contains(&i)));
    }

    #[tokio::test]
    async fn no_pending_blocks_outside_window_evicts_nothing() {
        let queue = FakeQueue::new();
        let user_id = uuid::Uuid::new_v4();
        let document_id = uuid::Uuid::new_v4();
        queue.add_pending(user_id, document_id, 5).await.unwrap();

        let evicted = evict_for_cursor(&queue, user_id, document_id, 5, 5, 10)
            .await
            .unwrap();
        assert!(evicted.is_empty());
    }
}
