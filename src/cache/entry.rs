//! Cache records and the staleness state machine.
//!
//! A [`CacheEntry`] is one cached page: Brotli-compressed content plus the
//! metadata needed for conditional requests and revalidation. At most one
//! live entry exists per cache key; it is mutated in place on every store.
//!
//! The `stale` flag is an atomic, independent of the metadata lock, so that
//! read-heavy [`CacheEntry::should_revalidate`] checks never contend with
//! content updates.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::codec;
use super::error::CacheError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::entry";

/// Incremental entries auto-revalidate once they are older than this.
const INCREMENTAL_MAX_AGE: time::Duration = time::Duration::hours(24);

/// Per-route cache policy. Fixed at entry creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Never revalidates, even when explicitly marked stale.
    Immutable,
    /// Revalidates only when explicitly marked stale.
    Static,
    /// Also auto-revalidates after a fixed age.
    Incremental,
    /// Never cached.
    Dynamic,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Immutable => "immutable",
            Strategy::Static => "static",
            Strategy::Incremental => "incremental",
            Strategy::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "immutable" => Ok(Strategy::Immutable),
            "static" => Ok(Strategy::Static),
            "incremental" => Ok(Strategy::Incremental),
            "dynamic" => Ok(Strategy::Dynamic),
            other => Err(CacheError::UnknownStrategy(other.to_string())),
        }
    }
}

struct EntryState {
    /// Canonical in-memory representation; Brotli output unless `compressed`
    /// is false (compression-failure fallback stored the raw bytes).
    content: Bytes,
    compressed: bool,
    rendered_at: OffsetDateTime,
    etag: String,
    request_path: String,
    generation: u64,
}

/// One cached page with metadata.
pub struct CacheEntry {
    state: RwLock<EntryState>,
    strategy: Strategy,
    stale: AtomicBool,
}

impl CacheEntry {
    /// Create a fresh entry at generation 1.
    pub fn new(content: Bytes, compressed: bool, strategy: Strategy, request_path: &str) -> Self {
        let rendered_at = OffsetDateTime::now_utc();
        let etag = generate_etag(&content, 1, rendered_at);
        Self {
            state: RwLock::new(EntryState {
                content,
                compressed,
                rendered_at,
                etag,
                request_path: request_path.to_string(),
                generation: 1,
            }),
            strategy,
            stale: AtomicBool::new(false),
        }
    }

    /// Reconstruct an entry from the durable compressed representation.
    ///
    /// Restart loses generation history and the original request path; the
    /// entry starts over at generation 1 with the default `static` strategy.
    pub(crate) fn from_disk(content: Bytes) -> Self {
        Self::new(content, true, Strategy::Static, "")
    }

    /// Overwrite content in place: advances the render timestamp, increments
    /// the generation, recomputes the ETag, and marks the entry fresh. An
    /// empty `request_path` preserves the previously recorded path.
    pub fn update(&self, content: Bytes, compressed: bool, request_path: &str) {
        let mut state = rw_write(&self.state, SOURCE, "update");
        state.rendered_at = OffsetDateTime::now_utc();
        state.generation += 1;
        state.etag = generate_etag(&content, state.generation, state.rendered_at);
        state.content = content;
        state.compressed = compressed;
        if !request_path.is_empty() {
            state.request_path = request_path.to_string();
        }
        drop(state);
        self.mark_fresh();
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Flag the entry as needing revalidation. No other field changes.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn mark_fresh(&self) {
        self.stale.store(false, Ordering::Release);
    }

    /// Strategy-aware revalidation policy, evaluated at read time.
    pub fn should_revalidate(&self) -> bool {
        self.should_revalidate_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn should_revalidate_at(&self, now: OffsetDateTime) -> bool {
        if self.strategy == Strategy::Immutable {
            return false;
        }

        if self.is_stale() {
            return true;
        }

        if self.strategy == Strategy::Incremental {
            return now - self.rendered_at() > INCREMENTAL_MAX_AGE;
        }

        // Static (and anything else) only revalidates when explicitly flagged.
        false
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Compressed in-memory representation.
    pub fn content(&self) -> Bytes {
        rw_read(&self.state, SOURCE, "content").content.clone()
    }

    /// Decompressed page bytes, ready to serve.
    pub fn decompressed_content(&self) -> Result<Bytes, CacheError> {
        let (content, compressed) = {
            let state = rw_read(&self.state, SOURCE, "decompressed_content");
            (state.content.clone(), state.compressed)
        };
        if !compressed {
            return Ok(content);
        }
        codec::decompress(&content).map(Bytes::from)
    }

    pub fn etag(&self) -> String {
        rw_read(&self.state, SOURCE, "etag").etag.clone()
    }

    pub fn generation(&self) -> u64 {
        rw_read(&self.state, SOURCE, "generation").generation
    }

    pub fn request_path(&self) -> String {
        rw_read(&self.state, SOURCE, "request_path")
            .request_path
            .clone()
    }

    pub fn rendered_at(&self) -> OffsetDateTime {
        rw_read(&self.state, SOURCE, "rendered_at").rendered_at
    }

    #[cfg(test)]
    pub(crate) fn set_rendered_at(&self, rendered_at: OffsetDateTime) {
        rw_write(&self.state, SOURCE, "set_rendered_at").rendered_at = rendered_at;
    }
}

/// Fingerprint over content, generation, and render timestamp.
///
/// Generation and timestamp feed the hash so that a content-identical
/// refresh still yields a new ETag; otherwise a no-op re-render would leave
/// clients holding an `If-None-Match` that never misses.
fn generate_etag(content: &[u8], generation: u64, rendered_at: OffsetDateTime) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(format!("{generation}:{}", rendered_at.unix_timestamp()));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(strategy: Strategy) -> CacheEntry {
        CacheEntry::new(Bytes::from_static(b"payload"), false, strategy, "/hello")
    }

    #[test]
    fn new_entry_starts_fresh_at_generation_one() {
        let entry = entry(Strategy::Static);
        assert_eq!(entry.generation(), 1);
        assert!(!entry.is_stale());
        assert_eq!(entry.request_path(), "/hello");
        assert!(!entry.etag().is_empty());
    }

    #[test]
    fn immutable_never_revalidates_even_when_flagged_stale() {
        let entry = entry(Strategy::Immutable);
        entry.mark_stale();
        assert!(entry.is_stale());
        assert!(!entry.should_revalidate());
    }

    #[test]
    fn stale_flag_forces_revalidation_for_non_immutable() {
        for strategy in [Strategy::Static, Strategy::Incremental, Strategy::Dynamic] {
            let entry = entry(strategy);
            entry.mark_stale();
            assert!(entry.should_revalidate(), "strategy {strategy}");
        }
    }

    #[test]
    fn incremental_revalidates_past_max_age() {
        let entry = entry(Strategy::Incremental);
        let now = OffsetDateTime::now_utc();
        assert!(!entry.should_revalidate_at(now));
        entry.set_rendered_at(now - time::Duration::hours(25));
        assert!(entry.should_revalidate_at(now));
    }

    #[test]
    fn static_stays_fresh_without_explicit_flag() {
        let entry = entry(Strategy::Static);
        let now = OffsetDateTime::now_utc();
        entry.set_rendered_at(now - time::Duration::hours(25));
        assert!(!entry.should_revalidate_at(now));
    }

    #[test]
    fn mark_fresh_clears_the_flag() {
        let entry = entry(Strategy::Static);
        entry.mark_stale();
        entry.mark_fresh();
        assert!(!entry.should_revalidate());
    }

    #[test]
    fn update_increments_generation_and_changes_etag_for_identical_content() {
        let entry = entry(Strategy::Static);
        let etag_before = entry.etag();
        entry.set_rendered_at(OffsetDateTime::now_utc() - time::Duration::seconds(2));

        entry.update(Bytes::from_static(b"payload"), false, "/hello");

        assert_eq!(entry.generation(), 2);
        assert_ne!(entry.etag(), etag_before);
        assert!(!entry.is_stale());
    }

    #[test]
    fn update_with_empty_path_preserves_previous_path() {
        let entry = entry(Strategy::Static);
        entry.update(Bytes::from_static(b"v2"), false, "");
        assert_eq!(entry.request_path(), "/hello");

        entry.update(Bytes::from_static(b"v3"), false, "/hello?lang=tr");
        assert_eq!(entry.request_path(), "/hello?lang=tr");
    }

    #[test]
    fn update_clears_staleness() {
        let entry = entry(Strategy::Incremental);
        entry.mark_stale();
        entry.update(Bytes::from_static(b"v2"), false, "");
        assert!(!entry.is_stale());
    }

    #[test]
    fn decompressed_content_honors_the_compressed_flag() {
        let raw = Bytes::from_static(b"<html>raw</html>");
        let fallback = CacheEntry::new(raw.clone(), false, Strategy::Static, "");
        assert_eq!(fallback.decompressed_content().expect("raw"), raw);

        let compressed = Bytes::from(super::super::codec::compress(&raw).expect("compress"));
        let entry = CacheEntry::new(compressed, true, Strategy::Static, "");
        assert_eq!(entry.decompressed_content().expect("decompress"), raw);
    }

    #[test]
    fn strategy_parses_catalog_strings() {
        assert_eq!("immutable".parse::<Strategy>().unwrap(), Strategy::Immutable);
        assert_eq!("static".parse::<Strategy>().unwrap(), Strategy::Static);
        assert_eq!(
            "incremental".parse::<Strategy>().unwrap(),
            Strategy::Incremental
        );
        assert_eq!("dynamic".parse::<Strategy>().unwrap(), Strategy::Dynamic);
        assert!("hourly".parse::<Strategy>().is_err());
    }
}
