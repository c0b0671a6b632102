// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the synthesis coordination engine: the fingerprint
//! function, queue payloads (`SynthesisJob`, `WorkerResult`), and the
//! WebSocket client/server message enums.

pub mod fingerprint;
pub mod wire;

pub use fingerprint::Fingerprint;
pub use wire::{
    BlockStatus, ClientMessage, DocumentId, ServerMessage, SynthesisJob, SynthesisMode, UserId,
    WorkerOutcome, WorkerResult,
};
