// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Read-only access to document block text (spec §1 cross-reference:
//! "Documents consumed by the transformer").
//!
//! Grounded on `yapit/gateway/api/v1/ws.py::_handle_synthesize`, which loads
//! `Block` rows by `(document_id, idx)` before calling `request_synthesis`
//! with `text=block.text`. The document-extraction pipeline that populates
//! this table is out of scope here; this module only reads what it leaves
//! behind, the same narrow slice the original WebSocket handler reads.

use async_trait::async_trait;
use sqlx::PgPool;
use tts_protocol::DocumentId;

use crate::error::RegistryError;

/// Storage port for resolving a block's synthesizable text.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Look up the text of block `block_idx` within `document_id`, if the
    /// document and block both exist.
    async fn block_text(
        &self,
        document_id: DocumentId,
        block_idx: u32,
    ) -> Result<Option<String>, RegistryError>;
}

/// Postgres-backed `BlockStore` over the `blocks` table populated by the
/// document-extraction pipeline.
pub struct PgBlockStore {
    pool: PgPool,
}

impl PgBlockStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the schema migration for the `blocks` table. In production this
    /// table is owned by the document-extraction pipeline; this migration
    /// only exists so the gateway can stand up a self-contained environment
    /// (demo binaries, tests) without that pipeline present.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS blocks (
                document_id UUID NOT NULL,
                idx BIGINT NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (document_id, idx)
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for PgBlockStore {
    async fn block_text(
        &self,
        document_id: DocumentId,
        block_idx: u32,
    ) -> Result<Option<String>, RegistryError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT text FROM blocks WHERE document_id = $1 AND idx = $2",
        )
        .bind(document_id)
        .bind(i64::from(block_idx))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(text,)| text))
    }
}

/// An in-memory `BlockStore` for unit tests and the demo binaries.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::{async_trait, BlockStore, DocumentId, RegistryError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory block text store, seeded up front via [`FakeBlockStore::insert`].
    #[derive(Default)]
    pub struct FakeBlockStore {
        rows: Mutex<HashMap<(DocumentId, u32), String>>,
    }

    impl FakeBlockStore {
        /// Seed the text for one block.
        pub fn insert(&self, document_id: DocumentId, block_idx: u32, text: impl Into<String>) {
            self.rows
                .lock()
                .expect("lock poisoned")
                .insert((document_id, block_idx), text.into());
        }
    }

    #[async_trait]
    impl BlockStore for FakeBlockStore {
        async fn block_text(
            &self,
            document_id: DocumentId,
            block_idx: u32,
        ) -> Result<Option<String>, RegistryError> {
            Ok(self
                .rows
                .lock()
                .expect("lock poisoned")
                .get(&(document_id, block_idx))
                .cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::fake::FakeBlockStore;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn seeded_block_is_found() {
        let store = FakeBlockStore::default();
        let doc = Uuid::new_v4();
        store.insert(doc, 3, "Hello there.");
        let text = store.block_text(doc, 3).await.unwrap();
        assert_eq!(text.as_deref(), Some("Hello there."));
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let store = FakeBlockStore::default();
        let doc = Uuid::new_v4();
        assert!(store.block_text(doc, 0).await.unwrap().is_none());
    }
}
