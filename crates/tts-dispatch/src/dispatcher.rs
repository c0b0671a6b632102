// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Synthesis Dispatcher (spec §4.2), grounded on
//! `yapit/gateway/synthesis.py::request_synthesis`/`_queue_job`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tts_cache::Cache;
use tts_protocol::{DocumentId, Fingerprint, SynthesisJob, SynthesisMode, UserId};
use tts_queue::{Queue, SubscriberEntry};
use tts_registry::{check_limit, Plan, ReservationStore, UsageLedger, VariantRegistry};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::model::ModelCatalog;

/// Resolves a user's current effective billing plan. Subscription state
/// itself is owned by the (out-of-scope) billing system; this port is the
/// dispatcher's only dependency on it.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    /// Return the plan currently applicable to `user_id`.
    async fn effective_plan(&self, user_id: UserId) -> Result<Plan, DispatchError>;
}

/// The outcome of a single `request_synthesis` call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Audio was already cached; no queue side-effect occurred.
    Cached {
        /// The resolved fingerprint.
        fingerprint: Fingerprint,
        /// Where the client can fetch the bytes.
        audio_url: String,
    },
    /// A job was enqueued (or deduplicated against one already in flight).
    Queued {
        /// The resolved fingerprint.
        fingerprint: Fingerprint,
    },
    /// The request was rejected before any queue side-effect.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Parameters for a single `request_synthesis` call, grouped to keep the
/// call site from drowning in positional arguments.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    /// Requesting user.
    pub user_id: UserId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Block index within the document.
    pub block_index: u32,
    /// Block text to synthesize.
    pub text: String,
    /// Model slug.
    pub model_slug: String,
    /// Voice slug.
    pub voice_slug: String,
    /// Free-form synthesis parameters.
    pub parameters: Value,
    /// Output codec.
    pub codec: String,
    /// Whether this consumes the server usage waterfall.
    pub synthesis_mode: SynthesisMode,
    /// Whether to register a subscriber/pending-set entry for WebSocket
    /// notification (false for REST polling callers).
    pub track_for_websocket: bool,
}

/// Ties the registry, queue, cache, usage ledger and plan resolver
/// together to implement `request_synthesis`.
pub struct Dispatcher<R, Q, C, L, V, P> {
    registry: Arc<R>,
    queue: Arc<Q>,
    cache: Arc<C>,
    ledger: Arc<L>,
    reservations: Arc<V>,
    plans: Arc<P>,
    catalog: ModelCatalog,
}

impl<R, Q, C, L, V, P> Dispatcher<R, Q, C, L, V, P>
where
    R: VariantRegistry,
    Q: Queue,
    C: Cache,
    L: UsageLedger,
    V: ReservationStore,
    P: PlanResolver,
{
    /// Build a dispatcher over the given ports.
    pub fn new(
        registry: Arc<R>,
        queue: Arc<Q>,
        cache: Arc<C>,
        ledger: Arc<L>,
        reservations: Arc<V>,
        plans: Arc<P>,
        catalog: ModelCatalog,
    ) -> Self {
        Self {
            registry,
            queue,
            cache,
            ledger,
            reservations,
            plans,
            catalog,
        }
    }

    /// Turn "please synthesize this block for this user" into either an
    /// immediate cache-hit notification or an enqueued job with its
    /// associated subscriber entry.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, document_id = %request.document_id, block_index = request.block_index))]
    pub async fn request_synthesis(
        &self,
        request: SynthesisRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let fingerprint = Fingerprint::compute(
            &request.text,
            &request.model_slug,
            &request.voice_slug,
            &request.parameters,
            &request.codec,
        );

        // Step 1-3: cache-hit fast path.
        if let Some(variant) = self.registry.get(&fingerprint).await? {
            if let Some(cache_ref) = &variant.cache_ref {
                if self.cache.exists(cache_ref).await? {
                    tracing::info!(fingerprint = %fingerprint, "cache_hit");
                    return Ok(DispatchOutcome::Cached {
                        fingerprint: fingerprint.clone(),
                        audio_url: format!("/v1/audio/{fingerprint}"),
                    });
                }
                // Invariant 6: a dangling cache_ref is not itself an error
                // condition for the caller; self-heal and fall through to
                // treat this as a miss.
                self.registry.clear_cache_ref(&fingerprint).await?;
            }
        }

        // Step 4: quota check for server-side synthesis.
        if request.synthesis_mode == SynthesisMode::Server {
            let amount = self.billable_amount(&request);
            let plan = self.plans.effective_plan(request.user_id).await?;
            let now = Utc::now();
            let (pool, _start, _end) = self
                .ledger
                .get_or_create_usage_period(request.user_id, now)
                .await?;
            let reserved = self
                .reservations
                .get_pending_reservations_total(request.user_id, now)
                .await?;
            if let Err(err) = check_limit(&plan, &pool, reserved, amount) {
                return Ok(DispatchOutcome::Error {
                    message: err.to_string(),
                });
            }
        }

        // Step 5: ensure the variant row exists.
        self.registry
            .variant_of(
                &request.text,
                &request.model_slug,
                &request.voice_slug,
                &request.parameters,
                &request.codec,
            )
            .await?;

        // Step 6: subscriber/pending-set bookkeeping (skipped for REST polling).
        if request.track_for_websocket {
            self.queue
                .add_subscriber(
                    &fingerprint,
                    SubscriberEntry {
                        user_id: request.user_id,
                        document_id: request.document_id,
                        block_index: request.block_index,
                    },
                )
                .await?;
            self.queue
                .add_pending(request.user_id, request.document_id, request.block_index)
                .await?;
        }

        // Step 7-8: deduplication gate.
        if !self.queue.acquire_inflight_lock(&fingerprint).await? {
            tracing::info!(fingerprint = %fingerprint, "deduplicated against in-flight work");
            return Ok(DispatchOutcome::Queued { fingerprint });
        }

        // Step 9: construct and enqueue the job.
        let job = SynthesisJob {
            job_id: Uuid::new_v4(),
            fingerprint: fingerprint.clone(),
            user_id: request.user_id,
            document_id: request.document_id,
            block_index: request.block_index,
            model_slug: request.model_slug.clone(),
            voice_slug: request.voice_slug.clone(),
            parameters: request.parameters.clone(),
            text: request.text.clone(),
            codec: request.codec.clone(),
            retry_count: 0,
            queued_at_ms: Utc::now().timestamp_millis(),
        };
        let index_field = request.track_for_websocket.then(|| {
            tts_queue::keys::index_field(
                &request.user_id.to_string(),
                &request.document_id.to_string(),
                request.block_index,
            )
        });
        self.queue.push(&job, index_field.as_deref()).await?;

        // Step 10: monitoring event.
        tracing::info!(fingerprint = %fingerprint, job_id = %job.job_id, "synthesis_queued");

        Ok(DispatchOutcome::Queued { fingerprint })
    }

    fn billable_amount(&self, request: &SynthesisRequest) -> i64 {
        let multiplier = self.catalog.usage_multiplier(&request.model_slug);
        (request.text.chars().count() as f64 * multiplier).round() as i64
    }
}
