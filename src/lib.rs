//! Ricordo — a two-tier response cache engine for content-serving
//! applications.
//!
//! Rendered pages are kept Brotli-compressed in a concurrent in-memory
//! index and mirrored to disk, so repeated requests skip rendering and the
//! cache survives restarts. Per-route strategies (`immutable`, `static`,
//! `incremental`, `dynamic`) drive a small staleness state machine; a
//! scheduled revalidator ages incremental pages out daily, and a
//! worker-pool warmer fills the cache from a route catalog ahead of
//! traffic.
//!
//! The embedding application wires the pieces together roughly like this:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ricordo::{CacheManager, Revalidator, WarmupConfig, response_cache_layer};
//!
//! # async fn run(router: axum::Router) -> Result<(), ricordo::CacheError> {
//! let manager = Arc::new(CacheManager::new("cache")?);
//!
//! // The router renders pages; its cache middleware writes through.
//! let app = router.layer(axum::middleware::from_fn_with_state(
//!     Arc::clone(&manager),
//!     response_cache_layer,
//! ));
//! manager.set_router(app.clone()).await;
//!
//! let warmup = WarmupConfig::new("config/routes.json", vec!["en".into()], app.clone());
//! let report = manager.bootstrap(warmup).await?;
//! tracing::info!(pages = report.pages, "cache warmed");
//!
//! let mut revalidator = Revalidator::new(Arc::clone(&manager));
//! revalidator.start(3);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod infra;

pub use cache::{
    CACHE_STATUS_HEADER, CacheEntry, CacheError, CacheManager, Revalidator, RevalidationStats,
    RouteCatalog, RouteConfig, RouteContext, Strategy, WARMUP_BYPASS_HEADER, WarmupConfig,
    WarmupReport, cache_key, response_cache_layer,
};
pub use config::Settings;
