use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "ricordo_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "ricordo_cache_miss_total";
pub(crate) const METRIC_WARMUP_MS: &str = "ricordo_cache_warmup_ms";
pub(crate) const METRIC_REVALIDATE_MS: &str = "ricordo_cache_revalidate_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError(err.to_string()))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Total number of responses served from the cache."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Total number of cache misses on the serving path."
        );
        describe_histogram!(
            METRIC_WARMUP_MS,
            Unit::Milliseconds,
            "Bulk warm-up wall-clock duration in milliseconds."
        );
        describe_histogram!(
            METRIC_REVALIDATE_MS,
            Unit::Milliseconds,
            "Eager revalidation wall-clock duration in milliseconds."
        );
    });
}
