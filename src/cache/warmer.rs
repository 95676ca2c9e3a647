//! Bulk cache warming from a route catalog.
//!
//! Routes are fanned out to a fixed pool of workers over a bounded queue.
//! Per-route and per-language failures (missing path, render failure) are
//! logged and counted as skipped; they never abort the batch. The caller
//! gets back a page count and the elapsed wall-clock time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use metrics::histogram;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WarmupSettings;
use crate::infra::telemetry::METRIC_WARMUP_MS;

use super::entry::Strategy;
use super::error::CacheError;
use super::manager::{CacheManager, cache_key, internal_request};

/// Fixed size of the warm-up worker pool.
const WARM_WORKERS: usize = 10;

/// One route descriptor from the catalog: a language-independent canonical
/// path, its per-language concrete URL paths, and the cache strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub canonical: String,
    pub paths: HashMap<String, String>,
    pub strategy: Strategy,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    routes: Vec<RouteConfig>,
}

/// Route catalog consumed by the bulk warmer.
#[derive(Debug, Clone)]
pub struct RouteCatalog {
    routes: Vec<RouteConfig>,
}

impl RouteCatalog {
    /// Load and parse the catalog. Unreadable or malformed catalogs are
    /// fatal to the bulk operation that requested them.
    pub async fn load(path: &Path) -> Result<Self, CacheError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|err| CacheError::CatalogRead {
                path: path.to_path_buf(),
                source: err,
            })?;
        let parsed: CatalogFile =
            serde_json::from_slice(&data).map_err(|err| CacheError::CatalogParse {
                path: path.to_path_buf(),
                source: err,
            })?;
        Ok(Self {
            routes: parsed.routes,
        })
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }
}

/// Inputs for a bulk warm-up or rebuild run.
pub struct WarmupConfig {
    pub catalog_path: PathBuf,
    pub languages: Vec<String>,
    pub router: Router,
    /// When set, languages already present in the cache are re-rendered
    /// instead of skipped.
    pub force_rebuild: bool,
    /// Cooperative abort signal; checked between work items.
    pub cancel: CancellationToken,
}

impl WarmupConfig {
    pub fn new(catalog_path: impl Into<PathBuf>, languages: Vec<String>, router: Router) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            languages,
            router,
            force_rebuild: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_settings(settings: &WarmupSettings, router: Router) -> Self {
        Self::new(&settings.catalog_path, settings.languages.clone(), router)
    }
}

/// Outcome of a bulk warm-up: pages (re)cached and wall-clock duration.
#[derive(Debug, Clone, Copy)]
pub struct WarmupReport {
    pub pages: usize,
    pub elapsed: Duration,
}

#[derive(Clone)]
struct WarmContext {
    manager: Arc<CacheManager>,
    router: Router,
    languages: Arc<Vec<String>>,
    filter: Option<Strategy>,
    force_rebuild: bool,
    cancel: CancellationToken,
    warmed: Arc<AtomicUsize>,
}

impl CacheManager {
    /// Warm the cache on startup: every cacheable route × language that is
    /// not already cached.
    pub async fn bootstrap(
        self: &Arc<Self>,
        config: WarmupConfig,
    ) -> Result<WarmupReport, CacheError> {
        info!("starting bootstrap cache warming");
        self.warm_routes(config, None).await
    }

    /// Force-rebuild every cacheable route × language.
    pub async fn rebuild_all(
        self: &Arc<Self>,
        mut config: WarmupConfig,
    ) -> Result<WarmupReport, CacheError> {
        config.force_rebuild = true;
        self.warm_routes(config, None).await
    }

    /// Force-rebuild routes matching `strategy`.
    pub async fn rebuild_by_strategy(
        self: &Arc<Self>,
        mut config: WarmupConfig,
        strategy: Strategy,
    ) -> Result<WarmupReport, CacheError> {
        config.force_rebuild = true;
        self.warm_routes(config, Some(strategy)).await
    }

    async fn warm_routes(
        self: &Arc<Self>,
        config: WarmupConfig,
        filter: Option<Strategy>,
    ) -> Result<WarmupReport, CacheError> {
        let catalog = RouteCatalog::load(&config.catalog_path).await?;
        info!(
            routes = catalog.routes().len(),
            strategy = filter.map(|s| s.as_str()).unwrap_or("all"),
            force_rebuild = config.force_rebuild,
            "starting cache warm-up"
        );
        let started = Instant::now();

        let (queue_tx, queue_rx) = mpsc::channel(catalog.routes().len().max(1));
        for route in catalog.routes() {
            // The queue is sized for the whole catalog, so this never blocks.
            if queue_tx.send(route.clone()).await.is_err() {
                break;
            }
        }
        drop(queue_tx);

        let ctx = WarmContext {
            manager: Arc::clone(self),
            router: config.router,
            languages: Arc::new(config.languages),
            filter,
            force_rebuild: config.force_rebuild,
            cancel: config.cancel,
            warmed: Arc::new(AtomicUsize::new(0)),
        };

        let queue = Arc::new(Mutex::new(queue_rx));
        let mut workers = JoinSet::new();
        for _ in 0..WARM_WORKERS {
            let ctx = ctx.clone();
            let queue = Arc::clone(&queue);
            workers.spawn(async move { warm_worker(ctx, queue).await });
        }
        while workers.join_next().await.is_some() {}

        let pages = ctx.warmed.load(Ordering::Relaxed);
        let elapsed = started.elapsed();
        histogram!(METRIC_WARMUP_MS).record(elapsed.as_secs_f64() * 1000.0);
        info!(
            pages,
            elapsed_ms = elapsed.as_millis() as u64,
            "cache warm-up completed"
        );

        Ok(WarmupReport { pages, elapsed })
    }
}

async fn warm_worker(ctx: WarmContext, queue: Arc<Mutex<mpsc::Receiver<RouteConfig>>>) {
    loop {
        let route = { queue.lock().await.recv().await };
        let Some(route) = route else {
            return;
        };
        if ctx.cancel.is_cancelled() {
            return;
        }

        if ctx
            .filter
            .is_some_and(|strategy| route.strategy != strategy)
        {
            continue;
        }
        if route.strategy == Strategy::Dynamic {
            debug!(canonical = %route.canonical, "skipping dynamic route");
            continue;
        }
        // Parameterized routes cannot be enumerated here; they fill in
        // on demand through the serving path.
        if route.canonical.contains('{') {
            debug!(canonical = %route.canonical, "skipping parameterized route");
            continue;
        }

        let cached = warm_route(&ctx, &route).await;
        ctx.warmed.fetch_add(cached, Ordering::Relaxed);
    }
}

/// Warm one route across every configured language. Returns the number of
/// language variants actually cached.
async fn warm_route(ctx: &WarmContext, route: &RouteConfig) -> usize {
    let mut tasks = JoinSet::new();
    for lang in ctx.languages.iter() {
        let ctx = ctx.clone();
        let route = route.clone();
        let lang = lang.clone();
        tasks.spawn(async move { warm_language(&ctx, &route, &lang).await });
    }

    let mut cached = 0;
    while let Some(joined) = tasks.join_next().await {
        if matches!(joined, Ok(true)) {
            cached += 1;
        }
    }
    cached
}

async fn warm_language(ctx: &WarmContext, route: &RouteConfig, lang: &str) -> bool {
    let key = cache_key(&route.canonical, lang, None);

    if !ctx.force_rebuild && ctx.manager.get(&key).await.is_some() {
        debug!(key, "already cached, skipping");
        return false;
    }

    let Some(path) = route.paths.get(lang).filter(|path| !path.is_empty()) else {
        warn!(canonical = %route.canonical, lang, "no path configured for language");
        return false;
    };

    let content = tokio::select! {
        _ = ctx.cancel.cancelled() => return false,
        rendered = internal_request(&ctx.router, path) => match rendered {
            Ok(content) => content,
            Err(err) => {
                error!(
                    canonical = %route.canonical,
                    lang,
                    path = %path,
                    error = %err,
                    "failed to render page for cache"
                );
                return false;
            }
        }
    };

    // Synchronous store: later skip-if-exists checks depend on the durable
    // write having completed.
    ctx.manager
        .set_sync(&key, content, route.strategy, path)
        .await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_parses_route_descriptors() {
        let raw = r#"{
            "routes": [
                {
                    "canonical": "/about",
                    "paths": {"en": "/en/about", "tr": "/tr/hakkinda"},
                    "strategy": "static"
                },
                {
                    "canonical": "/blog/{slug}",
                    "paths": {"en": "/en/blog/{slug}"},
                    "strategy": "incremental"
                }
            ]
        }"#;

        let parsed: CatalogFile = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.routes.len(), 2);
        assert_eq!(parsed.routes[0].strategy, Strategy::Static);
        assert_eq!(parsed.routes[0].paths["tr"], "/tr/hakkinda");
        assert_eq!(parsed.routes[1].strategy, Strategy::Incremental);
    }

    #[test]
    fn catalog_rejects_unknown_strategy() {
        let raw = r#"{"routes": [{"canonical": "/x", "paths": {}, "strategy": "hourly"}]}"#;
        assert!(serde_json::from_str::<CatalogFile>(raw).is_err());
    }

    #[tokio::test]
    async fn missing_catalog_is_fatal() {
        let err = RouteCatalog::load(Path::new("/nonexistent/routes.json"))
            .await
            .expect_err("missing file");
        assert!(matches!(err, CacheError::CatalogRead { .. }));
    }

    #[tokio::test]
    async fn malformed_catalog_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("routes.json");
        tokio::fs::write(&path, b"{not json").await.expect("write");

        let err = RouteCatalog::load(&path).await.expect_err("malformed");
        assert!(matches!(err, CacheError::CatalogParse { .. }));
    }
}
