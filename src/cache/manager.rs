//! Cache orchestration: the in-memory index over the durable tier.
//!
//! [`CacheManager`] is the single cache context object shared by the
//! serving layer, the revalidator, and the bulk warmer. It owns the
//! concurrent entry index and a [`Storage`] handle, and optionally holds a
//! late-bound router used to re-render stale pages in-process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as IndexEntry;
use http_body_util::BodyExt;
use metrics::histogram;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::infra::telemetry::METRIC_REVALIDATE_MS;

use super::codec;
use super::entry::{CacheEntry, Strategy};
use super::error::CacheError;
use super::storage::Storage;

/// Header attached to synthetic warm-up and revalidation requests so that
/// ingress-side protections (rate limiting, bans) let internal traffic pass.
pub const WARMUP_BYPASS_HEADER: &str = "x-internal-warmup";

/// Upper bound on concurrent eager re-renders.
const MAX_EAGER_CONCURRENCY: usize = 10;

/// Aggregate outcome of one eager-revalidation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RevalidationStats {
    /// Entries handed to the re-render pool.
    pub attempted: usize,
    /// Re-renders that returned a success status.
    pub succeeded: usize,
    /// Re-renders that failed or returned a non-success status.
    pub failed: usize,
    /// Entries skipped because they carry no request path.
    pub skipped: usize,
    pub elapsed: Duration,
}

enum WriteMode {
    /// Caller blocks until the durable write completes (bulk warming, where
    /// skip-if-exists checks on later routes depend on write ordering).
    Sync,
    /// Fire-and-forget durable write (request-serving hot path).
    Background,
}

/// Two-tier cache coordinator.
pub struct CacheManager {
    entries: DashMap<String, Arc<CacheEntry>>,
    storage: Arc<Storage>,
    router: RwLock<Option<Router>>,
    shutdown: CancellationToken,
}

impl CacheManager {
    /// Create a manager persisting to `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Ok(Self {
            entries: DashMap::new(),
            storage: Arc::new(Storage::new(cache_dir)?),
            router: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Look up an entry, reading through to disk on a memory miss.
    ///
    /// A durable-read failure degrades to a miss: it is logged, never
    /// escalated to the live request.
    pub async fn get(&self, cache_key: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.entries.get(cache_key) {
            return Some(Arc::clone(entry.value()));
        }

        if !self.storage.exists(cache_key).await {
            return None;
        }

        match self.storage.read_compressed(cache_key).await {
            Ok(compressed) => {
                let entry = Arc::new(CacheEntry::from_disk(compressed));
                self.entries
                    .insert(cache_key.to_string(), Arc::clone(&entry));
                debug!(key = cache_key, "loaded cache entry from disk");
                Some(entry)
            }
            Err(err) => {
                warn!(key = cache_key, error = %err, "failed to load cache entry from disk");
                None
            }
        }
    }

    /// Store content for `cache_key` with a fire-and-forget durable write.
    pub async fn set(
        &self,
        cache_key: &str,
        content: Bytes,
        strategy: Strategy,
        request_path: &str,
    ) {
        self.store(cache_key, content, strategy, request_path, WriteMode::Background)
            .await;
    }

    /// Store content for `cache_key`, blocking until the durable write
    /// completes.
    pub async fn set_sync(
        &self,
        cache_key: &str,
        content: Bytes,
        strategy: Strategy,
        request_path: &str,
    ) {
        self.store(cache_key, content, strategy, request_path, WriteMode::Sync)
            .await;
    }

    async fn store(
        &self,
        cache_key: &str,
        content: Bytes,
        strategy: Strategy,
        request_path: &str,
        mode: WriteMode,
    ) {
        let (stored, compressed_flag) = match codec::compress(&content) {
            Ok(compressed) => (Bytes::from(compressed), true),
            Err(err) => {
                error!(key = cache_key, error = %err, "failed to compress cache content, storing raw bytes");
                (content.clone(), false)
            }
        };

        match self.entries.entry(cache_key.to_string()) {
            IndexEntry::Occupied(occupied) => {
                let entry = occupied.get();
                entry.update(stored.clone(), compressed_flag, request_path);
                debug!(
                    key = cache_key,
                    strategy = %strategy,
                    request_path,
                    generation = entry.generation(),
                    "cache entry updated"
                );
            }
            IndexEntry::Vacant(vacant) => {
                vacant.insert(Arc::new(CacheEntry::new(
                    stored.clone(),
                    compressed_flag,
                    strategy,
                    request_path,
                )));
                debug!(key = cache_key, strategy = %strategy, request_path, "cache entry created");
            }
        }

        // Durable-write failures never fail the in-memory update; the memory
        // tier stays authoritative for this process until the next write.
        match mode {
            WriteMode::Sync => {
                if let Err(err) = self.storage.write(cache_key, &stored, &content).await {
                    error!(key = cache_key, error = %err, "failed to write cache entry to disk");
                }
            }
            WriteMode::Background => {
                let storage = Arc::clone(&self.storage);
                let key = cache_key.to_string();
                tokio::spawn(async move {
                    if let Err(err) = storage.write(&key, &stored, &content).await {
                        error!(key, error = %err, "failed to write cache entry to disk");
                    }
                });
            }
        }
    }

    /// Remove an entry from both tiers. Missing durable files are tolerated.
    pub async fn delete(&self, cache_key: &str) -> Result<(), CacheError> {
        self.entries.remove(cache_key);
        self.storage.delete(cache_key).await
    }

    /// Mark memory-resident entries matching `strategy` as stale, skipping
    /// immutable entries unconditionally. Returns the number affected; when
    /// `eager` is set, newly-stale entries are re-rendered in the background.
    pub fn mark_stale(self: &Arc<Self>, strategy: Strategy, eager: bool) -> usize {
        self.mark_matching(Some(strategy), eager)
    }

    /// Mark every non-immutable memory-resident entry as stale.
    pub fn mark_all_stale(self: &Arc<Self>, eager: bool) -> usize {
        self.mark_matching(None, eager)
    }

    fn mark_matching(self: &Arc<Self>, filter: Option<Strategy>, eager: bool) -> usize {
        let mut count = 0;
        let mut newly_stale = Vec::new();

        for item in self.entries.iter() {
            let entry = item.value();
            if entry.strategy() == Strategy::Immutable {
                continue;
            }
            if filter.is_some_and(|strategy| entry.strategy() != strategy) {
                continue;
            }

            entry.mark_stale();
            count += 1;
            if eager {
                newly_stale.push(Arc::clone(entry));
            }
            debug!(key = item.key(), strategy = %entry.strategy(), "marked cache entry stale");
        }

        info!(
            strategy = filter.map(|s| s.as_str()).unwrap_or("all"),
            count, eager, "marked cache entries stale"
        );

        if eager && !newly_stale.is_empty() {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.eager_revalidate(newly_stale).await;
            });
        }

        count
    }

    /// Late-bind the re-rendering capability. The router typically depends
    /// on the manager itself, so it cannot be supplied at construction.
    pub async fn set_router(&self, router: Router) {
        *self.router.write().await = Some(router);
    }

    /// Signal background work (eager re-renders) to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of memory-resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Re-render newly-stale entries through the bound router, at most
    /// [`MAX_EAGER_CONCURRENCY`] at a time.
    ///
    /// Success here means the router answered `200 OK`; persistence happens (or
    /// not) through the router's own write-through path. Entries without a
    /// request path cannot be re-rendered and are skipped.
    pub(crate) async fn eager_revalidate(
        &self,
        entries: Vec<Arc<CacheEntry>>,
    ) -> RevalidationStats {
        let router = self.router.read().await.clone();
        let Some(router) = router else {
            warn!("eager revalidation skipped, no router bound");
            return RevalidationStats::default();
        };

        info!(count = entries.len(), "starting eager revalidation");
        let started = Instant::now();

        let semaphore = Arc::new(Semaphore::new(MAX_EAGER_CONCURRENCY));
        let mut tasks = JoinSet::new();
        let mut stats = RevalidationStats::default();

        for entry in entries {
            let request_path = entry.request_path();
            if request_path.is_empty() {
                warn!("skipping stale entry without request path");
                stats.skipped += 1;
                continue;
            }

            stats.attempted += 1;
            let router = router.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.shutdown.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                tokio::select! {
                    _ = cancel.cancelled() => false,
                    result = internal_request(&router, &request_path) => result.is_ok(),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => stats.succeeded += 1,
                _ => stats.failed += 1,
            }
        }

        stats.elapsed = started.elapsed();
        histogram!(METRIC_REVALIDATE_MS).record(stats.elapsed.as_secs_f64() * 1000.0);
        info!(
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "eager revalidation completed"
        );

        stats
    }
}

/// Derive a cache key from a canonical path, language, and path parameters:
/// `{param}` placeholders are substituted, then `:<lang>` is appended.
pub fn cache_key(
    canonical: &str,
    lang: &str,
    path_params: Option<&HashMap<String, String>>,
) -> String {
    let mut key = canonical.to_string();
    if let Some(params) = path_params {
        for (param, value) in params {
            key = key.replace(&format!("{{{param}}}"), value);
        }
    }
    format!("{key}:{lang}")
}

/// Issue a synthetic in-process GET to the router, expecting a success
/// status and a byte body. Carries the bypass marker so ingress protections
/// ignore internal traffic.
pub(crate) async fn internal_request(router: &Router, path: &str) -> Result<Bytes, CacheError> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(WARMUP_BYPASS_HEADER, "true")
        .body(Body::empty())
        .map_err(|err| CacheError::render(path, err.to_string()))?;

    let response = router
        .clone()
        .oneshot(request)
        .await
        .map_err(|err| match err {})?;

    if response.status() != StatusCode::OK {
        return Err(CacheError::render(
            path,
            format!("unexpected status {}", response.status()),
        ));
    }

    response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| CacheError::render(path, err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::get;

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn cache_key_substitutes_params_and_appends_language() {
        assert_eq!(
            cache_key("/blog/{slug}", "en", Some(&params(&[("slug", "hello")]))),
            "/blog/hello:en"
        );
        assert_eq!(cache_key("/about", "tr", None), "/about:tr");
        assert_eq!(
            cache_key(
                "/docs/{section}/{page}",
                "en",
                Some(&params(&[("section", "api"), ("page", "cache")]))
            ),
            "/docs/api/cache:en"
        );
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CacheManager::new(dir.path()).expect("manager");

        manager
            .set_sync(
                "/about:en",
                Bytes::from_static(b"<html>about</html>"),
                Strategy::Static,
                "/en/about",
            )
            .await;

        let entry = manager.get("/about:en").await.expect("entry");
        assert_eq!(entry.generation(), 1);
        assert_eq!(entry.strategy(), Strategy::Static);
        assert_eq!(
            entry.decompressed_content().expect("content"),
            Bytes::from_static(b"<html>about</html>")
        );
    }

    #[tokio::test]
    async fn get_misses_when_absent_from_both_tiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CacheManager::new(dir.path()).expect("manager");
        assert!(manager.get("/missing:en").await.is_none());
    }

    #[tokio::test]
    async fn repeated_set_updates_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CacheManager::new(dir.path()).expect("manager");

        manager
            .set_sync("/about:en", Bytes::from_static(b"v1"), Strategy::Static, "/en/about")
            .await;
        manager
            .set_sync("/about:en", Bytes::from_static(b"v2"), Strategy::Static, "")
            .await;

        let entry = manager.get("/about:en").await.expect("entry");
        assert_eq!(entry.generation(), 2);
        assert_eq!(entry.request_path(), "/en/about");
        assert_eq!(
            entry.decompressed_content().expect("content"),
            Bytes::from_static(b"v2")
        );
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn restart_reconstructs_entry_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = Bytes::from_static(b"<html>survives restart</html>");

        {
            let manager = CacheManager::new(dir.path()).expect("manager");
            manager
                .set_sync("/about:en", payload.clone(), Strategy::Incremental, "/en/about")
                .await;
        }

        // A fresh manager over the same directory simulates process restart:
        // the memory index is gone, the durable tier is not.
        let manager = CacheManager::new(dir.path()).expect("manager");
        let entry = manager.get("/about:en").await.expect("entry");
        assert_eq!(entry.generation(), 1);
        assert_eq!(entry.strategy(), Strategy::Static);
        assert!(!entry.is_stale());
        assert_eq!(entry.decompressed_content().expect("content"), payload);
    }

    #[tokio::test]
    async fn delete_removes_both_tiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = CacheManager::new(dir.path()).expect("manager");

        manager
            .set_sync("/about:en", Bytes::from_static(b"v1"), Strategy::Static, "")
            .await;
        manager.delete("/about:en").await.expect("delete");

        assert!(manager.get("/about:en").await.is_none());
        assert!(!manager.storage().exists("/about:en").await);

        // Deleting a key that was never cached is not an error.
        manager.delete("/never:en").await.expect("delete missing");
    }

    #[tokio::test]
    async fn mark_stale_flips_only_matching_strategy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(CacheManager::new(dir.path()).expect("manager"));

        manager
            .set_sync("/a:en", Bytes::from_static(b"a"), Strategy::Incremental, "")
            .await;
        manager
            .set_sync("/b:en", Bytes::from_static(b"b"), Strategy::Static, "")
            .await;
        manager
            .set_sync("/c:en", Bytes::from_static(b"c"), Strategy::Immutable, "")
            .await;

        let count = manager.mark_stale(Strategy::Incremental, false);
        assert_eq!(count, 1);
        assert!(manager.get("/a:en").await.expect("a").is_stale());
        assert!(!manager.get("/b:en").await.expect("b").is_stale());
        assert!(!manager.get("/c:en").await.expect("c").is_stale());
    }

    #[tokio::test]
    async fn mark_all_stale_spares_immutable_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(CacheManager::new(dir.path()).expect("manager"));

        manager
            .set_sync("/a:en", Bytes::from_static(b"a"), Strategy::Incremental, "")
            .await;
        manager
            .set_sync("/b:en", Bytes::from_static(b"b"), Strategy::Static, "")
            .await;
        manager
            .set_sync("/c:en", Bytes::from_static(b"c"), Strategy::Immutable, "")
            .await;

        let count = manager.mark_all_stale(false);
        assert_eq!(count, 2);
        assert!(!manager.get("/c:en").await.expect("c").is_stale());
        assert!(!manager.get("/c:en").await.expect("c").should_revalidate());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_sets_on_distinct_keys_lose_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(CacheManager::new(dir.path()).expect("manager"));

        let mut tasks = JoinSet::new();
        for i in 0..32 {
            let manager = Arc::clone(&manager);
            tasks.spawn(async move {
                let key = format!("/page/{i}:en");
                for _ in 0..4 {
                    manager
                        .set_sync(&key, Bytes::from(format!("content {i}")), Strategy::Static, "")
                        .await;
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(manager.len(), 32);
        for i in 0..32 {
            let entry = manager.get(&format!("/page/{i}:en")).await.expect("entry");
            assert_eq!(entry.generation(), 4);
        }
    }

    #[tokio::test]
    async fn eager_revalidation_reports_outcomes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(CacheManager::new(dir.path()).expect("manager"));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new()
            .route(
                "/en/ok",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { "fresh" }
                }),
            )
            .route("/en/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        manager.set_router(router).await;

        let ok = Arc::new(CacheEntry::new(
            Bytes::from_static(b"x"),
            false,
            Strategy::Incremental,
            "/en/ok",
        ));
        let broken = Arc::new(CacheEntry::new(
            Bytes::from_static(b"x"),
            false,
            Strategy::Incremental,
            "/en/broken",
        ));
        let pathless = Arc::new(CacheEntry::new(
            Bytes::from_static(b"x"),
            false,
            Strategy::Incremental,
            "",
        ));

        let stats = manager.eager_revalidate(vec![ok, broken, pathless]).await;

        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eager_revalidation_without_router_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(CacheManager::new(dir.path()).expect("manager"));

        let entry = Arc::new(CacheEntry::new(
            Bytes::from_static(b"x"),
            false,
            Strategy::Static,
            "/en/about",
        ));
        let stats = manager.eager_revalidate(vec![entry]).await;
        assert_eq!(stats.attempted, 0);
    }
}
