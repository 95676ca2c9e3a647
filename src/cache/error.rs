use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the cache engine.
///
/// Per-item failures during bulk warming and eager revalidation are logged
/// and counted rather than returned; only operation-fatal conditions reach
/// callers through this type.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage io at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read route catalog `{path}`: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed route catalog `{path}`: {source}")]
    CatalogParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("brotli codec failed: {0}")]
    Codec(#[source] std::io::Error),
    #[error("render request for `{path}` failed: {detail}")]
    Render { path: String, detail: String },
    #[error("unknown cache strategy `{0}`")]
    UnknownStrategy(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn render(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Render {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
