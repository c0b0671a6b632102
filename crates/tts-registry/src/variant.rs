// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Fingerprint & Variant Registry (spec §4.1).
//!
//! Grounded on `yapit/gateway/domain_models.py`'s `BlockVariant` and the
//! variant lookups in `yapit/gateway/synthesis.py::request_synthesis`. The
//! variant row here is keyed purely by fingerprint, not by block, per the
//! fingerprint-stability invariant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tts_protocol::Fingerprint;

use crate::error::RegistryError;

/// The durable record of a fingerprint, optionally carrying a reference to
/// materialized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Content fingerprint; primary key.
    pub fingerprint: Fingerprint,
    /// Model slug used to produce this variant.
    pub model_id: String,
    /// Voice slug used to produce this variant.
    pub voice_id: String,
    /// Output codec this variant was synthesized in, e.g. `"opus"`.
    pub codec: String,
    /// Audio duration once synthesized.
    pub duration_ms: Option<i64>,
    /// Reference to the materialized audio in the cache, if any.
    pub cache_ref: Option<String>,
    /// When this variant row was first created.
    pub created_at: DateTime<Utc>,
}

impl Variant {
    /// True when the variant's bytes have been materialized into the cache.
    pub fn is_cached(&self) -> bool {
        self.cache_ref.is_some()
    }
}

/// Storage port for variants, implemented against Postgres in production
/// and against an in-memory map in tests.
#[async_trait]
pub trait VariantRegistry: Send + Sync {
    /// Look up a variant by fingerprint, if it already exists.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Variant>, RegistryError>;

    /// Compute the fingerprint for this input and return the existing
    /// variant, or create and return a fresh one.
    async fn variant_of(
        &self,
        text: &str,
        model_id: &str,
        voice_id: &str,
        parameters: &Value,
        codec: &str,
    ) -> Result<Variant, RegistryError>;

    /// Record a successful synthesis: set `duration_ms` and `cache_ref`.
    async fn set_cache_ref(
        &self,
        fingerprint: &Fingerprint,
        cache_ref: &str,
        duration_ms: i64,
    ) -> Result<(), RegistryError>;

    /// Clear a dangling `cache_ref` (cache-referential integrity, invariant 6).
    async fn clear_cache_ref(&self, fingerprint: &Fingerprint) -> Result<(), RegistryError>;
}

/// Postgres-backed `VariantRegistry`.
pub struct PgVariantRegistry {
    pool: PgPool,
}

impl PgVariantRegistry {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the schema migration for the `variants` table. Intended for use
    /// from a binary's startup sequence or a migrations runner.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS variants (
                fingerprint TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                voice_id TEXT NOT NULL,
                codec TEXT NOT NULL DEFAULT 'opus',
                duration_ms BIGINT,
                cache_ref TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VariantRegistry for PgVariantRegistry {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Variant>, RegistryError> {
        let row = sqlx::query_as::<_, VariantRow>(
            "SELECT fingerprint, model_id, voice_id, codec, duration_ms, cache_ref, created_at \
             FROM variants WHERE fingerprint = $1",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Variant::from))
    }

    async fn variant_of(
        &self,
        text: &str,
        model_id: &str,
        voice_id: &str,
        parameters: &Value,
        codec: &str,
    ) -> Result<Variant, RegistryError> {
        let fingerprint = Fingerprint::compute(text, model_id, voice_id, parameters, codec);

        if let Some(existing) = self.get(&fingerprint).await? {
            return Ok(existing);
        }

        let row = sqlx::query_as::<_, VariantRow>(
            r"
            INSERT INTO variants (fingerprint, model_id, voice_id, codec)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (fingerprint) DO UPDATE SET fingerprint = EXCLUDED.fingerprint
            RETURNING fingerprint, model_id, voice_id, codec, duration_ms, cache_ref, created_at
            ",
        )
        .bind(fingerprint.as_str())
        .bind(model_id)
        .bind(voice_id)
        .bind(codec)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn set_cache_ref(
        &self,
        fingerprint: &Fingerprint,
        cache_ref: &str,
        duration_ms: i64,
    ) -> Result<(), RegistryError> {
        sqlx::query("UPDATE variants SET cache_ref = $2, duration_ms = $3 WHERE fingerprint = $1")
            .bind(fingerprint.as_str())
            .bind(cache_ref)
            .bind(duration_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_cache_ref(&self, fingerprint: &Fingerprint) -> Result<(), RegistryError> {
        sqlx::query("UPDATE variants SET cache_ref = NULL WHERE fingerprint = $1")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct VariantRow {
    fingerprint: String,
    model_id: String,
    voice_id: String,
    codec: String,
    duration_ms: Option<i64>,
    cache_ref: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<VariantRow> for Variant {
    fn from(row: VariantRow) -> Self {
        Self {
            fingerprint: Fingerprint::from_hex(row.fingerprint),
            model_id: row.model_id,
            voice_id: row.voice_id,
            codec: row.codec,
            duration_ms: row.duration_ms,
            cache_ref: row.cache_ref,
            created_at: row.created_at,
        }
    }
}

/// An in-memory `VariantRegistry` for unit tests and the demo binaries.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::{async_trait, DateTime, Fingerprint, RegistryError, Utc, Value, Variant, VariantRegistry};
    use std::sync::Mutex;
    use std::collections::HashMap;

    /// In-memory variant store behind a mutex; good enough for tests since
    /// the registry's own concurrency story is delegated to Postgres row
    /// locks in production.
    #[derive(Default)]
    pub struct FakeVariantRegistry {
        rows: Mutex<HashMap<String, Variant>>,
    }

    #[async_trait]
    impl VariantRegistry for FakeVariantRegistry {
        async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Variant>, RegistryError> {
            Ok(self.rows.lock().expect("lock poisoned").get(fingerprint.as_str()).cloned())
        }

        async fn variant_of(
            &self,
            text: &str,
            model_id: &str,
            voice_id: &str,
            parameters: &Value,
            codec: &str,
        ) -> Result<Variant, RegistryError> {
            let fingerprint = Fingerprint::compute(text, model_id, voice_id, parameters, codec);
            let mut rows = self.rows.lock().expect("lock poisoned");
            if let Some(existing) = rows.get(fingerprint.as_str()) {
                return Ok(existing.clone());
            }
            let variant = Variant {
                fingerprint: fingerprint.clone(),
                model_id: model_id.to_string(),
                voice_id: voice_id.to_string(),
                codec: codec.to_string(),
                duration_ms: None,
                cache_ref: None,
                created_at: DateTime::<Utc>::MIN_UTC,
            };
            rows.insert(fingerprint.as_str().to_string(), variant.clone());
            Ok(variant)
        }

        async fn set_cache_ref(
            &self,
            fingerprint: &Fingerprint,
            cache_ref: &str,
            duration_ms: i64,
        ) -> Result<(), RegistryError> {
            let mut rows = self.rows.lock().expect("lock poisoned");
            if let Some(variant) = rows.get_mut(fingerprint.as_str()) {
                variant.cache_ref = Some(cache_ref.to_string());
                variant.duration_ms = Some(duration_ms);
            }
            Ok(())
        }

        async fn clear_cache_ref(&self, fingerprint: &Fingerprint) -> Result<(), RegistryError> {
            let mut rows = self.rows.lock().expect("lock poisoned");
            if let Some(variant) = rows.get_mut(fingerprint.as_str()) {
                variant.cache_ref = None;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::fake::FakeVariantRegistry;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn variant_of_creates_then_reuses_the_same_row() {
        let registry = FakeVariantRegistry::default();
        let params = json!({});
        let first = registry
            .variant_of("Hello.", "kokoro", "af_heart", &params, "opus")
            .await
            .unwrap();
        let second = registry
            .variant_of("Hello.", "kokoro", "af_heart", &params, "opus")
            .await
            .unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(!first.is_cached());
    }

    #[tokio::test]
    async fn set_cache_ref_marks_variant_as_cached() {
        let registry = FakeVariantRegistry::default();
        let params = json!({});
        let variant = registry
            .variant_of("Hello.", "kokoro", "af_heart", &params, "opus")
            .await
            .unwrap();
        registry
            .set_cache_ref(&variant.fingerprint, "abc123", 900)
            .await
            .unwrap();
        let reloaded = registry.get(&variant.fingerprint).await.unwrap().unwrap();
        assert!(reloaded.is_cached());
        assert_eq!(reloaded.duration_ms, Some(900));
    }

    #[tokio::test]
    async fn clear_cache_ref_restores_cache_referential_integrity() {
        let registry = FakeVariantRegistry::default();
        let params = json!({});
        let variant = registry
            .variant_of("Hello.", "kokoro", "af_heart", &params, "opus")
            .await
            .unwrap();
        registry
            .set_cache_ref(&variant.fingerprint, "abc123", 900)
            .await
            .unwrap();
        registry.clear_cache_ref(&variant.fingerprint).await.unwrap();
        let reloaded = registry.get(&variant.fingerprint).await.unwrap().unwrap();
        assert!(!reloaded.is_cached());
    }
}
