// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structured logging bootstrap shared by `tts-gateway` and `tts-worker`.

use tracing_subscriber::EnvFilter;

/// Initialize a `tracing` subscriber reading `RUST_LOG` (defaulting to `info`).
///
/// Call once near the top of `main`. Idempotent within a process is not
/// guaranteed — calling twice will panic, matching `tracing`'s own contract.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
