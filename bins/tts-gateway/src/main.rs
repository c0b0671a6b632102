// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `tts-gateway` binary: wires the registry, queue, cache, usage ledger
//! and dispatcher together behind a WebSocket and a small REST surface,
//! then runs the Result Consumer and Visibility Scanner alongside it.

mod hub;
mod plan;
mod result_consumer;
mod rest;
mod state;
mod visibility_scanner;
mod ws;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tts_cache::{CacheConfig, SqliteCache};
use tts_dispatch::{Dispatcher, ModelCatalog};
use tts_queue::RedisQueue;
use tts_registry::{PgBlockStore, PgReservationStore, PgUsageLedger, PgVariantRegistry};

use crate::hub::Hub;
use crate::plan::StaticPlanResolver;
use crate::state::AppState;

/// One `slug:multiplier` pair, e.g. `kokoro:1.0`.
#[derive(Debug, Clone)]
struct ModelSpec {
    slug: String,
    usage_multiplier: f64,
}

impl std::str::FromStr for ModelSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (slug, multiplier) = s
            .split_once(':')
            .ok_or_else(|| format!("expected SLUG:MULTIPLIER, got {s:?}"))?;
        let usage_multiplier = multiplier
            .parse()
            .map_err(|_| format!("invalid multiplier in {s:?}"))?;
        Ok(Self {
            slug: slug.to_string(),
            usage_multiplier,
        })
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "TTS synthesis dispatch gateway")]
struct Args {
    /// TCP listener for browser clients.
    #[arg(long, env = "TTS_GATEWAY_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Postgres connection string for the registry, usage ledger and
    /// reservations.
    #[arg(long, env = "TTS_DATABASE_URL")]
    database_url: String,
    /// Path to the SQLite audio cache database.
    #[arg(long, env = "TTS_CACHE_PATH", default_value = "tts-cache.sqlite3")]
    cache_path: String,
    /// Redis connection string for the queue protocol.
    #[arg(long, env = "TTS_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,
    /// Maximum audio cache size in bytes before LRU eviction.
    #[arg(long, default_value_t = 10 * 1024 * 1024 * 1024)]
    cache_max_size_bytes: i64,
    /// Known models and their billing multipliers, e.g. `kokoro:1.0`.
    /// Repeatable.
    #[arg(long = "model", value_parser = clap::value_parser!(ModelSpec))]
    models: Vec<ModelSpec>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tts_app_core::logging::init("info");

    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&args.database_url)
        .await
        .context("connect to postgres")?;

    let sqlite_options = SqliteConnectOptions::new()
        .filename(&args.cache_path)
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);
    let sqlite_pool = SqlitePoolOptions::new()
        .connect_with(sqlite_options)
        .await
        .context("open sqlite audio cache")?;

    let redis_client = RedisClient::open(args.redis_url.as_str()).context("open redis client")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("connect to redis")?;

    let registry = Arc::new(PgVariantRegistry::new(pg_pool.clone()));
    registry.migrate().await.context("migrate variants table")?;

    let ledger = Arc::new(PgUsageLedger::new(pg_pool.clone()));
    ledger.migrate().await.context("migrate usage tables")?;

    let reservations = Arc::new(PgReservationStore::new(pg_pool.clone()));
    reservations.migrate().await.context("migrate reservations table")?;

    let blocks = Arc::new(PgBlockStore::new(pg_pool.clone()));
    blocks.migrate().await.context("migrate blocks table")?;

    let cache = Arc::new(SqliteCache::new(
        sqlite_pool,
        CacheConfig {
            max_size_bytes: args.cache_max_size_bytes,
            ..CacheConfig::default()
        },
    ));
    cache.migrate().await.context("migrate cache table")?;

    let queue = Arc::new(RedisQueue::new(redis_conn));
    let plans = Arc::new(StaticPlanResolver);

    let mut catalog = ModelCatalog::new();
    for model in &args.models {
        catalog.register(model.slug.clone(), model.usage_multiplier);
    }

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        queue.clone(),
        cache.clone(),
        ledger.clone(),
        reservations.clone(),
        plans.clone(),
        catalog,
    ));

    let state = Arc::new(AppState {
        dispatcher,
        registry,
        queue,
        cache,
        ledger,
        plans,
        blocks,
        hub: Arc::new(Mutex::new(Hub::default())),
    });

    let consumer_state = state.clone();
    tokio::spawn(async move { result_consumer::run(consumer_state).await });

    let scanner_state = state.clone();
    tokio::spawn(async move { visibility_scanner::run(scanner_state).await });

    let app = Router::new()
        .route("/v1/ws/tts", get(ws::ws_handler))
        .route("/v1/audio/{fingerprint}", get(rest::get_audio))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .context("bind listener")?;
    tracing::info!(listen = %args.listen, "tts-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
