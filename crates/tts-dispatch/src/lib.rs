// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Synthesis dispatch: turns a block request into a cache hit or an
//! enqueued job, and retires jobs that scroll out of view.

pub mod dispatcher;
pub mod error;
pub mod evictor;
pub mod model;

pub use dispatcher::{DispatchOutcome, Dispatcher, PlanResolver, SynthesisRequest};
pub use error::DispatchError;
pub use evictor::{evict_for_cursor, BufferWindow, DEFAULT_BUFFER_AHEAD, DEFAULT_BUFFER_BEHIND};
pub use model::{ModelCatalog, ModelInfo};
