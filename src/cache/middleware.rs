//! Response-cache middleware: the serving-layer boundary of the engine.
//!
//! The external routing layer resolves each request to a [`RouteContext`]
//! (canonical path, language, strategy) and stores it in the request
//! extensions; this layer then serves hits out of the cache and
//! write-through caches successful misses.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, warn};

use crate::infra::telemetry::{METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL};

use super::entry::Strategy;
use super::manager::{CacheManager, cache_key};

/// Marker header on responses served from the cache.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Largest response body the middleware will cache. Larger pages are
/// served as rendered, just never stored.
const MAX_CACHEABLE_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Routing resolution handed to the cache layer by the external router.
#[derive(Debug, Clone)]
pub struct RouteContext {
    /// Language-independent canonical path, possibly with `{param}`
    /// placeholders already substituted by the router.
    pub canonical: String,
    pub language: String,
    pub strategy: Strategy,
}

/// Serve GET requests from the cache; on miss, render and write through.
///
/// Requests without a [`RouteContext`] extension pass straight through, as
/// do non-GET methods and dynamic routes. Only 200 responses are cached.
pub async fn response_cache_layer(
    State(manager): State<Arc<CacheManager>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let Some(route) = request.extensions().get::<RouteContext>().cloned() else {
        return next.run(request).await;
    };
    if route.canonical.is_empty() {
        return next.run(request).await;
    }

    let key = cache_key(&route.canonical, &route.language, None);

    if let Some(entry) = manager.get(&key).await {
        if !entry.should_revalidate() {
            match entry.decompressed_content() {
                Ok(content) => {
                    counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                    debug!(key, "serving cached response");
                    let etag = entry.etag();
                    return (
                        [
                            (header::CONTENT_TYPE.as_str(), "text/html; charset=utf-8"),
                            (CACHE_STATUS_HEADER, "HIT"),
                            (header::ETAG.as_str(), etag.as_str()),
                        ],
                        content,
                    )
                        .into_response();
                }
                Err(err) => {
                    warn!(key, error = %err, "failed to decompress cached content");
                }
            }
        }
    }

    counter!(METRIC_CACHE_MISS_TOTAL).increment(1);

    if route.strategy == Strategy::Dynamic {
        return next.run(request).await;
    }

    let request_path = request.uri().path().to_string();
    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            // The rendered body itself failed mid-stream; there is nothing
            // left to serve.
            warn!(key, error = %err, "failed to buffer response body for caching");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if bytes.len() > MAX_CACHEABLE_BODY_BYTES {
        debug!(key, size = bytes.len(), "response too large to cache, serving uncached");
        return Response::from_parts(parts, Body::from(bytes));
    }

    // Hot path: the durable write happens in the background.
    manager
        .set(&key, bytes.clone(), route.strategy, &request_path)
        .await;
    debug!(key, strategy = %route.strategy, "cached response");

    Response::from_parts(parts, Body::from(bytes))
}
