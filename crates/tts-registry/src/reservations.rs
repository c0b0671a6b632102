// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reservations: pre-billing holds against a user's available balance
//! (spec §4.9), grounded on `yapit/gateway/reservations.py`.
//!
//! The original keeps these in a Redis hash with a 48h TTL. This design
//! stores them in Postgres alongside the usage ledger (an `expires_at`
//! column stands in for Redis's TTL, since Postgres has no native one) —
//! recorded as an Open Question decision in the design doc.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::error::RegistryError;

/// A reservation's TTL: estimates are held this long even if the extraction
/// job that created them never reports completion.
pub const RESERVATION_TTL: Duration = Duration::hours(48);

/// Storage port for per-user reservations.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Create or replace a reservation for `content_hash`, estimating
    /// `estimated_tokens` characters of future usage.
    async fn create_reservation(
        &self,
        user_id: uuid::Uuid,
        content_hash: &str,
        estimated_tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Release (delete) a reservation once its extraction job finishes, in
    /// any terminal state.
    async fn release_reservation(
        &self,
        user_id: uuid::Uuid,
        content_hash: &str,
    ) -> Result<(), RegistryError>;

    /// Look up a single reservation's estimate, if still live.
    async fn get_reservation(
        &self,
        user_id: uuid::Uuid,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, RegistryError>;

    /// Sum of all live (non-expired) reservations for a user, used by
    /// `check_limit` to prevent over-submission before billing lands.
    async fn get_pending_reservations_total(
        &self,
        user_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, RegistryError>;
}

/// Postgres-backed `ReservationStore`.
pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the schema migration for the `reservations` table.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS reservations (
                user_id UUID NOT NULL,
                content_hash TEXT NOT NULL,
                estimated_tokens BIGINT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, content_hash)
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_reservations_user ON reservations (user_id, expires_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn create_reservation(
        &self,
        user_id: uuid::Uuid,
        content_hash: &str,
        estimated_tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let expires_at = now + RESERVATION_TTL;
        sqlx::query(
            r"
            INSERT INTO reservations (user_id, content_hash, estimated_tokens, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, content_hash)
            DO UPDATE SET estimated_tokens = EXCLUDED.estimated_tokens, expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(user_id)
        .bind(content_hash)
        .bind(estimated_tokens)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_reservation(
        &self,
        user_id: uuid::Uuid,
        content_hash: &str,
    ) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM reservations WHERE user_id = $1 AND content_hash = $2")
            .bind(user_id)
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_reservation(
        &self,
        user_id: uuid::Uuid,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, RegistryError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT estimated_tokens FROM reservations \
             WHERE user_id = $1 AND content_hash = $2 AND expires_at > $3",
        )
        .bind(user_id)
        .bind(content_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(tokens,)| tokens))
    }

    async fn get_pending_reservations_total(
        &self,
        user_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, RegistryError> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(estimated_tokens) FROM reservations WHERE user_id = $1 AND expires_at > $2",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.unwrap_or(0))
    }
}

/// In-memory `ReservationStore` for unit tests and the demo binaries.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::{async_trait, DateTime, RegistryError, ReservationStore, Utc, RESERVATION_TTL};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory reservation store behind a mutex.
    #[derive(Default)]
    pub struct FakeReservationStore {
        rows: Mutex<HashMap<(uuid::Uuid, String), (i64, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl ReservationStore for FakeReservationStore {
        async fn create_reservation(
            &self,
            user_id: uuid::Uuid,
            content_hash: &str,
            estimated_tokens: i64,
            now: DateTime<Utc>,
        ) -> Result<(), RegistryError> {
            self.rows.lock().expect("lock poisoned").insert(
                (user_id, content_hash.to_string()),
                (estimated_tokens, now + RESERVATION_TTL),
            );
            Ok(())
        }

        async fn release_reservation(
            &self,
            user_id: uuid::Uuid,
            content_hash: &str,
        ) -> Result<(), RegistryError> {
            self.rows
                .lock()
                .expect("lock poisoned")
                .remove(&(user_id, content_hash.to_string()));
            Ok(())
        }

        async fn get_reservation(
            &self,
            user_id: uuid::Uuid,
            content_hash: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<i64>, RegistryError> {
            let rows = self.rows.lock().expect("lock poisoned");
            Ok(rows
                .get(&(user_id, content_hash.to_string()))
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(tokens, _)| *tokens))
        }

        async fn get_pending_reservations_total(
            &self,
            user_id: uuid::Uuid,
            now: DateTime<Utc>,
        ) -> Result<i64, RegistryError> {
            let rows = self.rows.lock().expect("lock poisoned");
            Ok(rows
                .iter()
                .filter(|((uid, _), (_, expires_at))| *uid == user_id && *expires_at > now)
                .map(|(_, (tokens, _))| tokens)
                .sum())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::fake::FakeReservationStore;
    use super::*;

    #[tokio::test]
    async fn reservation_sum_excludes_expired_entries() {
        let store = FakeReservationStore::default();
        let user = uuid::Uuid::nil();
        let now = Utc::now();
        store.create_reservation(user, "doc-a", 500, now).await.unwrap();
        store.create_reservation(user, "doc-b", 250, now).await.unwrap();
        let total = store.get_pending_reservations_total(user, now).await.unwrap();
        assert_eq!(total, 750);

        let far_future = now + RESERVATION_TTL + Duration::hours(1);
        let total = store.get_pending_reservations_total(user, far_future).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn release_removes_the_reservation() {
        let store = FakeReservationStore::default();
        let user = uuid::Uuid::nil();
        let now = Utc::now();
        store.create_reservation(user, "doc-a", 500, now).await.unwrap();
        store.release_reservation(user, "doc-a").await.unwrap();
        assert_eq!(store.get_reservation(user, "doc-a", now).await.unwrap(), None);
    }
}
