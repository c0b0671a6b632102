// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A `PlanResolver` that always returns the free plan.
//!
//! Subscription state lives in the (out-of-scope) billing system per
//! spec.md §1's non-goals; this gateway has no billing-system client to
//! call, so it resolves every user to [`tts_registry::Plan::free`]. A real
//! deployment would inject a resolver backed by that system's API instead.

use async_trait::async_trait;
use tts_dispatch::{DispatchError, PlanResolver};
use tts_protocol::UserId;
use tts_registry::Plan;

/// Resolves every user to the zero-limit free plan.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPlanResolver;

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn effective_plan(&self, _user_id: UserId) -> Result<Plan, DispatchError> {
        Ok(Plan::free())
    }
}
