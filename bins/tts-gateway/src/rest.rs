// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `GET /v1/audio/{fingerprint}` (spec §6): serves cached audio bytes for a
//! browser `<audio>` tag.
//!
//! Sample rate, channel count and sample width are not stored per-variant
//! (the cache table only ever held a size in bytes, see
//! `tts-cache::cache::CacheConfig`); every variant in this deployment is
//! produced by `LocalEchoAdapter`, so these headers are fixed constants tied
//! to that adapter's output format rather than read from storage. A second
//! adapter would need these promoted into the variant row.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use tts_protocol::Fingerprint;
use tts_registry::VariantRegistry;

use crate::state::AppState;

const SAMPLE_RATE_HZ: &str = "16000";
const CHANNELS: &str = "1";
const SAMPLE_WIDTH_BITS: &str = "16";

pub async fn get_audio(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    let fingerprint = Fingerprint::from_hex(fingerprint);

    let variant = match state.registry.get(&fingerprint).await {
        Ok(Some(variant)) => variant,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(%err, "audio lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some(cache_ref) = &variant.cache_ref else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let bytes = match state.cache.as_ref().retrieve(cache_ref).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(%err, "cache retrieve failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_str(&format!("audio/{}", variant.codec))
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        "X-Audio-Codec",
        HeaderValue::from_str(&variant.codec).unwrap_or_else(|_| HeaderValue::from_static("opus")),
    );
    headers.insert("X-Sample-Rate", HeaderValue::from_static(SAMPLE_RATE_HZ));
    headers.insert("X-Channels", HeaderValue::from_static(CHANNELS));
    headers.insert("X-Sample-Width", HeaderValue::from_static(SAMPLE_WIDTH_BITS));
    if let Some(duration_ms) = variant.duration_ms {
        if let Ok(value) = HeaderValue::from_str(&duration_ms.to_string()) {
            headers.insert("X-Duration-Ms", value);
        }
    }

    (headers, bytes).into_response()
}
