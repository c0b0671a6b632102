// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Fingerprint & Variant Registry, the Usage Waterfall, and
//! Reservations: the durable state behind the synthesis coordination
//! engine.

pub mod blocks;
pub mod error;
pub mod reservations;
pub mod variant;
pub mod waterfall;

pub use blocks::{BlockStore, PgBlockStore};
pub use error::RegistryError;
pub use reservations::{PgReservationStore, ReservationStore, RESERVATION_TTL};
pub use variant::{PgVariantRegistry, Variant, VariantRegistry};
pub use waterfall::{
    available_balance, check_limit, consume, effective_plan, ConsumptionBreakdown, Plan,
    PgUsageLedger, Subscription, SubscriptionStatus, UsageLedger, UsagePool, UsageSummary,
    ROLLOVER_CAP,
};
