// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Usage Waterfall: subscription → rollover → purchased → debt (spec §4.9).
//!
//! Grounded on `yapit/gateway/usage.py`. All arithmetic is fixed-width
//! integer (characters), per the design note against floating-point pools.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::RegistryError;

/// Rollover pool balances are capped at this many tokens.
pub const ROLLOVER_CAP: i64 = 10_000_000;

/// A billing plan's period limit. Free/past-due/canceled users fall back to
/// [`Plan::FREE`], the zero-limit sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Human-readable plan name.
    pub name: String,
    /// Characters grantable per subscription period.
    pub subscription_limit: i64,
}

impl Plan {
    /// The sentinel plan used for free, past-due, or canceled users: every
    /// paid feature reads as zero-limit.
    pub fn free() -> Self {
        Self {
            name: "free".to_string(),
            subscription_limit: 0,
        }
    }
}

/// Subscription lifecycle status, as tracked by the (out-of-scope) billing
/// system and read here only to compute the effective plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscription is in good standing.
    Active,
    /// Payment failed; plan may still apply until `grace_until`.
    PastDue,
    /// Subscription was canceled; plan may still apply until `grace_until`.
    Canceled,
}

/// A user's subscription record, as needed to compute the effective plan.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Current lifecycle status.
    pub status: SubscriptionStatus,
    /// The plan this subscription would grant while active.
    pub plan: Plan,
    /// Grace deadline: a past-due or canceled subscription still grants
    /// `plan` until this instant, after which it falls back to
    /// [`Plan::free`].
    ///
    /// Supplement from `original_source`: `usage.py::get_effective_plan`
    /// applies this fallback; it is not explicit in the distilled spec but
    /// is fair game per the instructions (silence is an invitation).
    pub grace_until: Option<DateTime<Utc>>,
}

/// Resolve a subscription's effective plan at `now`, applying the grace
/// period fallback for past-due/canceled subscriptions.
pub fn effective_plan(subscription: Option<&Subscription>, now: DateTime<Utc>) -> Plan {
    let Some(sub) = subscription else {
        return Plan::free();
    };
    match sub.status {
        SubscriptionStatus::Active => sub.plan.clone(),
        SubscriptionStatus::PastDue | SubscriptionStatus::Canceled => match sub.grace_until {
            Some(until) if now < until => sub.plan.clone(),
            _ => Plan::free(),
        },
    }
}

/// Per-user, per-period numeric state tracked by the waterfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsagePool {
    /// Characters already consumed from the subscription pool this period.
    pub subscription_used: i64,
    /// Tokens carried from previous periods; may go negative (debt).
    pub rollover: i64,
    /// Top-up credits with no period expiry.
    pub purchased: i64,
}

impl UsagePool {
    /// A fresh pool with no usage yet.
    pub fn new(rollover: i64, purchased: i64) -> Self {
        Self {
            subscription_used: 0,
            rollover,
            purchased,
        }
    }
}

/// Breakdown of where a single `consume` call's characters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumptionBreakdown {
    /// Characters drawn from the subscription pool.
    pub from_subscription: i64,
    /// Characters drawn from a positive rollover balance.
    pub from_rollover: i64,
    /// Characters drawn from purchased credits.
    pub from_purchased: i64,
    /// Characters that overflowed into rollover debt (negative rollover).
    pub overflow_to_debt: i64,
}

impl ConsumptionBreakdown {
    /// Sum of all four components; must equal the requested `amount`.
    pub fn total(&self) -> i64 {
        self.from_subscription + self.from_rollover + self.from_purchased + self.overflow_to_debt
    }
}

/// Consume `amount` characters from a user's pool per the waterfall order:
/// subscription → rollover (if positive) → purchased → debt overflow.
///
/// Returns the updated pool and a breakdown whose components always sum to
/// `amount` (invariant checked in tests below).
pub fn consume(plan: &Plan, pool: UsagePool, amount: i64) -> (UsagePool, ConsumptionBreakdown) {
    let mut remaining = amount;
    let mut breakdown = ConsumptionBreakdown::default();
    let mut pool = pool;

    let subscription_available = (plan.subscription_limit - pool.subscription_used).max(0);
    let from_subscription = remaining.min(subscription_available);
    pool.subscription_used += from_subscription;
    remaining -= from_subscription;
    breakdown.from_subscription = from_subscription;

    if remaining > 0 && pool.rollover > 0 {
        let from_rollover = remaining.min(pool.rollover);
        pool.rollover -= from_rollover;
        remaining -= from_rollover;
        breakdown.from_rollover = from_rollover;
    }

    if remaining > 0 && pool.purchased > 0 {
        let from_purchased = remaining.min(pool.purchased);
        pool.purchased -= from_purchased;
        remaining -= from_purchased;
        breakdown.from_purchased = from_purchased;
    }

    if remaining > 0 {
        pool.rollover -= remaining;
        breakdown.overflow_to_debt = remaining;
    }

    (pool, breakdown)
}

/// Compute the balance available for a pre-flight `check_limit`, in
/// characters, after subtracting pending reservations.
pub fn available_balance(plan: &Plan, pool: &UsagePool, pending_reservations_sum: i64) -> i64 {
    let subscription_headroom = (plan.subscription_limit - pool.subscription_used).max(0);
    subscription_headroom + pool.rollover.max(0) + pool.purchased - pending_reservations_sum
}

/// Pre-flight quota check: fails with `UsageLimitExceeded` if the user's
/// available balance cannot cover `amount`.
pub fn check_limit(
    plan: &Plan,
    pool: &UsagePool,
    pending_reservations_sum: i64,
    amount: i64,
) -> Result<(), RegistryError> {
    let available = available_balance(plan, pool, pending_reservations_sum);
    if available < amount {
        return Err(RegistryError::UsageLimitExceeded {
            requested: amount,
            available,
        });
    }
    Ok(())
}

/// A summary of a user's usage for a period, as returned to (out-of-scope)
/// REST/billing surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSummary {
    /// This period's plan limit.
    pub subscription_limit: i64,
    /// Characters consumed from the subscription pool this period.
    pub subscription_used: i64,
    /// Current rollover balance (may be negative).
    pub rollover: i64,
    /// Current purchased credit balance.
    pub purchased: i64,
    /// Period start.
    pub period_start: DateTime<Utc>,
    /// Period end.
    pub period_end: DateTime<Utc>,
}

/// Durable store for usage pools and the audit trail of each consumption.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Load (or lazily create) the current period's pool for a user.
    async fn get_or_create_usage_period(
        &self,
        user_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<(UsagePool, DateTime<Utc>, DateTime<Utc>), RegistryError>;

    /// Apply a consumption, persist the updated pool, and append an audit
    /// log entry with the breakdown. Row-level locked in the Postgres
    /// implementation (`SELECT ... FOR UPDATE`) so concurrent Result
    /// Consumers for the same user serialize.
    async fn record_usage(
        &self,
        user_id: uuid::Uuid,
        plan: &Plan,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<ConsumptionBreakdown, RegistryError>;

    /// Read-only summary for display/reporting.
    async fn get_usage_summary(
        &self,
        user_id: uuid::Uuid,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary, RegistryError>;
}

/// Postgres-backed `UsageLedger`.
pub struct PgUsageLedger {
    pool: PgPool,
}

impl PgUsageLedger {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the schema migration for the `usage_pools` and `usage_audit`
    /// tables.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS usage_pools (
                user_id UUID PRIMARY KEY,
                subscription_used BIGINT NOT NULL DEFAULT 0,
                rollover BIGINT NOT NULL DEFAULT 0,
                purchased BIGINT NOT NULL DEFAULT 0,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS usage_audit (
                id BIGSERIAL PRIMARY KEY,
                user_id UUID NOT NULL,
                from_subscription BIGINT NOT NULL,
                from_rollover BIGINT NOT NULL,
                from_purchased BIGINT NOT NULL,
                overflow_to_debt BIGINT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn get_or_create_usage_period(
        &self,
        user_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<(UsagePool, DateTime<Utc>, DateTime<Utc>), RegistryError> {
        let row = sqlx::query_as::<_, UsagePoolRow>(
            "SELECT subscription_used, rollover, purchased, period_start, period_end \
             FROM usage_pools WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            if row.period_end > now {
                return Ok((row.pool(), row.period_start, row.period_end));
            }
        }

        let period_start = now;
        let period_end = now + chrono::Duration::days(30);
        let rollover_carry = row.map_or(0, |r| (r.rollover + r.purchased).clamp(-ROLLOVER_CAP, ROLLOVER_CAP));

        sqlx::query(
            r"
            INSERT INTO usage_pools (user_id, subscription_used, rollover, purchased, period_start, period_end)
            VALUES ($1, 0, $2, 0, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                subscription_used = 0, rollover = EXCLUDED.rollover, purchased = 0,
                period_start = EXCLUDED.period_start, period_end = EXCLUDED.period_end
            ",
        )
        .bind(user_id)
        .bind(rollover_carry)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        Ok((UsagePool::new(rollover_carry, 0), period_start, period_end))
    }

    async fn record_usage(
        &self,
        user_id: uuid::Uuid,
        plan: &Plan,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<ConsumptionBreakdown, RegistryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, UsagePoolRow>(
            "SELECT subscription_used, rollover, purchased, period_start, period_end \
             FROM usage_pools WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(RegistryError::NoUsagePeriod)?;

        if row.period_end <= now {
            return Err(RegistryError::NoUsagePeriod);
        }

        let (updated, breakdown) = consume(plan, row.pool(), amount);

        sqlx::query(
            "UPDATE usage_pools SET subscription_used = $2, rollover = $3, purchased = $4 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(updated.subscription_used)
        .bind(updated.rollover)
        .bind(updated.purchased)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO usage_audit (user_id, from_subscription, from_rollover, from_purchased, overflow_to_debt)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(user_id)
        .bind(breakdown.from_subscription)
        .bind(breakdown.from_rollover)
        .bind(breakdown.from_purchased)
        .bind(breakdown.overflow_to_debt)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(breakdown)
    }

    async fn get_usage_summary(
        &self,
        user_id: uuid::Uuid,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary, RegistryError> {
        let (pool, period_start, period_end) = self.get_or_create_usage_period(user_id, now).await?;
        Ok(UsageSummary {
            subscription_limit: plan.subscription_limit,
            subscription_used: pool.subscription_used,
            rollover: pool.rollover,
            purchased: pool.purchased,
            period_start,
            period_end,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UsagePoolRow {
    subscription_used: i64,
    rollover: i64,
    purchased: i64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

impl UsagePoolRow {
    fn pool(&self) -> UsagePool {
        UsagePool {
            subscription_used: self.subscription_used,
            rollover: self.rollover,
            purchased: self.purchased,
        }
    }
}

/// In-memory `UsageLedger` for unit tests and the demo binaries.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::{
        async_trait, consume, ConsumptionBreakdown, DateTime, Plan, RegistryError, UsageLedger,
        UsagePool, UsageSummary, Utc,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory usage ledger behind a mutex.
    #[derive(Default)]
    pub struct FakeUsageLedger {
        pools: Mutex<HashMap<uuid::Uuid, (UsagePool, DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl UsageLedger for FakeUsageLedger {
        async fn get_or_create_usage_period(
            &self,
            user_id: uuid::Uuid,
            now: DateTime<Utc>,
        ) -> Result<(UsagePool, DateTime<Utc>, DateTime<Utc>), RegistryError> {
            let mut pools = self.pools.lock().expect("lock poisoned");
            let entry = pools.entry(user_id).or_insert_with(|| {
                (UsagePool::new(0, 0), now, now + chrono::Duration::days(30))
            });
            Ok(*entry)
        }

        async fn record_usage(
            &self,
            user_id: uuid::Uuid,
            plan: &Plan,
            amount: i64,
            now: DateTime<Utc>,
        ) -> Result<ConsumptionBreakdown, RegistryError> {
            let (pool, start, end) = self.get_or_create_usage_period(user_id, now).await?;
            let (updated, breakdown) = consume(plan, pool, amount);
            self.pools.lock().expect("lock poisoned").insert(user_id, (updated, start, end));
            Ok(breakdown)
        }

        async fn get_usage_summary(
            &self,
            user_id: uuid::Uuid,
            plan: &Plan,
            now: DateTime<Utc>,
        ) -> Result<UsageSummary, RegistryError> {
            let (pool, period_start, period_end) = self.get_or_create_usage_period(user_id, now).await?;
            Ok(UsageSummary {
                subscription_limit: plan.subscription_limit,
                subscription_used: pool.subscription_used,
                rollover: pool.rollover,
                purchased: pool.purchased,
                period_start,
                period_end,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use proptest::prelude::*;

    fn plan(limit: i64) -> Plan {
        Plan {
            name: "test".to_string(),
            subscription_limit: limit,
        }
    }

    #[test]
    fn drains_subscription_before_rollover_and_purchased() {
        let p = plan(1000);
        let pool = UsagePool::new(500, 500);
        let (updated, breakdown) = consume(&p, pool, 300);
        assert_eq!(breakdown.from_subscription, 300);
        assert_eq!(breakdown.from_rollover, 0);
        assert_eq!(breakdown.from_purchased, 0);
        assert_eq!(updated.subscription_used, 300);
    }

    #[test]
    fn overflows_into_rollover_debt_once_all_pools_exhausted() {
        let p = plan(100);
        let pool = UsagePool::new(50, 20);
        let (updated, breakdown) = consume(&p, pool, 300);
        assert_eq!(breakdown.from_subscription, 100);
        assert_eq!(breakdown.from_rollover, 50);
        assert_eq!(breakdown.from_purchased, 20);
        assert_eq!(breakdown.overflow_to_debt, 130);
        assert_eq!(updated.rollover, -130);
        assert_eq!(breakdown.total(), 300);
    }

    #[test]
    fn negative_rollover_is_never_drawn_from() {
        let p = plan(1000);
        let pool = UsagePool::new(-50, 100);
        let (_updated, breakdown) = consume(&p, pool, 60);
        assert_eq!(breakdown.from_rollover, 0);
        assert_eq!(breakdown.from_subscription, 60);
    }

    #[test]
    fn check_limit_denies_when_reservation_consumes_headroom() {
        let p = plan(10_000);
        let pool = UsagePool {
            subscription_used: 9_950,
            rollover: 0,
            purchased: 0,
        };
        assert!(check_limit(&p, &pool, 0, 100).is_err());
        assert!(check_limit(&p, &pool, 0, 50).is_ok());
    }

    #[test]
    fn reservation_release_restores_available_balance() {
        let p = plan(100);
        let pool = UsagePool::new(0, 0);
        // Fully reserved: check_limit(1) denies.
        assert!(check_limit(&p, &pool, 100, 1).is_err());
        // Reservation released: check_limit(1) now allows.
        assert!(check_limit(&p, &pool, 0, 1).is_ok());
    }

    #[test]
    fn grace_period_keeps_higher_plan_until_deadline() {
        let now = Utc::now();
        let sub = Subscription {
            status: SubscriptionStatus::Canceled,
            plan: plan(5_000),
            grace_until: Some(now + chrono::Duration::hours(1)),
        };
        assert_eq!(effective_plan(Some(&sub), now).subscription_limit, 5_000);
        assert_eq!(
            effective_plan(Some(&sub), now + chrono::Duration::hours(2)),
            Plan::free()
        );
    }

    #[test]
    fn no_subscription_falls_back_to_free_plan() {
        assert_eq!(effective_plan(None, Utc::now()), Plan::free());
    }

    proptest! {
        #[test]
        fn waterfall_conserves_the_requested_amount(
            subscription_limit in 0i64..1_000_000,
            subscription_used in 0i64..1_000_000,
            rollover in -1_000_000i64..1_000_000,
            purchased in 0i64..1_000_000,
            amount in 0i64..2_000_000,
        ) {
            let p = plan(subscription_limit);
            let pool = UsagePool {
                subscription_used: subscription_used.min(subscription_limit),
                rollover,
                purchased,
            };
            let (_updated, breakdown) = consume(&p, pool, amount);
            prop_assert_eq!(breakdown.total(), amount);
            if pool.rollover <= 0 {
                prop_assert_eq!(breakdown.from_rollover, 0);
            }
        }
    }
}
