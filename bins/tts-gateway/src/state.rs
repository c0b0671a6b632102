// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application state threaded through every axum handler and
//! background task.

use std::sync::Arc;

use tts_cache::SqliteCache;
use tts_dispatch::Dispatcher;
use tts_queue::RedisQueue;
use tts_registry::{PgBlockStore, PgReservationStore, PgUsageLedger, PgVariantRegistry};

use crate::plan::StaticPlanResolver;

/// The concrete `Dispatcher` instantiation this gateway wires together.
pub type GatewayDispatcher = Dispatcher<
    PgVariantRegistry,
    RedisQueue,
    SqliteCache,
    PgUsageLedger,
    PgReservationStore,
    StaticPlanResolver,
>;

/// Per-user synthesize requests allowed in a rolling 60-second window,
/// grounded on `yapit/contracts.py::MAX_TTS_REQUESTS_PER_MINUTE`.
pub const MAX_TTS_REQUESTS_PER_MINUTE: u32 = 300;

/// State shared across the WebSocket handler, the REST audio route, the
/// Result Consumer and the Visibility Scanner.
pub struct AppState {
    /// Turns a block request into a cache hit or an enqueued job.
    pub dispatcher: Arc<GatewayDispatcher>,
    /// Direct registry handle, for the REST audio route and the Result
    /// Consumer's `set_cache_ref` calls.
    pub registry: Arc<PgVariantRegistry>,
    /// Direct queue handle, for rate limiting, eviction, and the Result
    /// Consumer / Visibility Scanner loops.
    pub queue: Arc<RedisQueue>,
    /// Direct cache handle, for the REST audio route and the Result
    /// Consumer's `store` call.
    pub cache: Arc<SqliteCache>,
    /// Direct usage ledger handle, for the Result Consumer's billing step.
    pub ledger: Arc<PgUsageLedger>,
    /// Resolves per-user billing plans for the Result Consumer.
    pub plans: Arc<StaticPlanResolver>,
    /// Resolves per-block synthesis text.
    pub blocks: Arc<PgBlockStore>,
    /// In-process WebSocket subscriber fan-out.
    pub hub: crate::hub::SharedHub,
}
