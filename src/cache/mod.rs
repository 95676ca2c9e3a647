//! Ricordo cache engine.
//!
//! Two tiers per cache key:
//!
//! - **Memory**: a concurrent index of [`CacheEntry`] records holding
//!   Brotli-compressed page content.
//! - **Disk**: compressed and decompressed files, surviving restarts.
//!
//! [`CacheManager`] coordinates both tiers; [`Revalidator`] ages
//! incremental entries out on a daily schedule; the bulk warmer populates
//! the cache from a route catalog ahead of traffic.

mod codec;
mod entry;
mod error;
mod lock;
mod manager;
mod middleware;
mod revalidator;
mod storage;
mod warmer;

pub use entry::{CacheEntry, Strategy};
pub use error::CacheError;
pub use manager::{
    CacheManager, RevalidationStats, WARMUP_BYPASS_HEADER, cache_key,
};
pub use middleware::{CACHE_STATUS_HEADER, RouteContext, response_cache_layer};
pub use revalidator::Revalidator;
pub use storage::Storage;
pub use warmer::{RouteCatalog, RouteConfig, WarmupConfig, WarmupReport};
