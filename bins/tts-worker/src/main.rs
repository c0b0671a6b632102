// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `tts-worker` binary: one process serving one model slug, grounded on
//! `yapit/workers/tts_loop.py`'s per-model worker process convention.
//!
//! Ships with [`tts_worker::LocalEchoAdapter`] as its only engine; a real
//! deployment would swap in an engine-specific adapter per binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use redis::Client as RedisClient;
use tts_queue::RedisQueue;
use tts_worker::{run_api_tts_dispatcher, run_tts_worker, LocalEchoAdapter, WorkerConfig};

/// Which runner loop a worker process uses.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DispatchMode {
    /// Bounded, sequential pull loop with processing-set tracking, for a
    /// GPU-style model that can only run one job at a time.
    Sequential,
    /// Unbounded, fire-and-forget dispatch, for an API-backed model with
    /// its own concurrency limits.
    Concurrent,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "TTS pull-worker process")]
struct Args {
    /// Unique id for this worker process.
    #[arg(long, env = "TTS_WORKER_ID")]
    worker_id: String,
    /// The model slug this worker pulls jobs for.
    #[arg(long, env = "TTS_WORKER_MODEL_SLUG")]
    model_slug: String,
    /// Billing multiplier applied to every completed job.
    #[arg(long, default_value_t = 1.0)]
    usage_multiplier: f64,
    /// Redis connection string for the queue protocol.
    #[arg(long, env = "TTS_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
    /// Seconds to block on an empty queue before looping again.
    #[arg(long, default_value_t = 5)]
    pull_timeout_secs: u64,
    /// Which runner loop to use for this model.
    #[arg(long, value_enum, default_value_t = DispatchMode::Sequential)]
    mode: DispatchMode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tts_app_core::logging::init("info");

    let redis_client = RedisClient::open(args.redis_url.as_str()).context("open redis client")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("connect to redis")?;
    let queue = Arc::new(RedisQueue::new(redis_conn));
    let adapter = Arc::new(LocalEchoAdapter::new());

    let config = WorkerConfig {
        worker_id: args.worker_id.clone(),
        model_slug: args.model_slug.clone(),
        usage_multiplier: args.usage_multiplier,
        pull_timeout: Duration::from_secs(args.pull_timeout_secs),
    };

    tracing::info!(
        worker_id = %args.worker_id,
        model_slug = %args.model_slug,
        mode = ?args.mode,
        "tts-worker starting"
    );

    match args.mode {
        DispatchMode::Sequential => run_tts_worker(queue, adapter, config).await?,
        DispatchMode::Concurrent => run_api_tts_dispatcher(queue, adapter, config).await?,
    }

    Ok(())
}
