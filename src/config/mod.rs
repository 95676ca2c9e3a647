//! Configuration layer: typed settings with layered precedence (file → env).
//!
//! The embedding application may also build [`Settings`] directly; this
//! module exists so deployments can drive the cache from `ricordo.toml` and
//! `RICORDO__`-prefixed environment variables without extra glue.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ricordo";
const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_CATALOG_PATH: &str = "config/routes.json";
const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_REVALIDATION_HOUR: u8 = 3;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub warmup: WarmupSettings,
    pub revalidation: RevalidationSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Directory holding the durable tier.
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WarmupSettings {
    /// Route catalog consumed by the bulk warmer.
    pub catalog_path: PathBuf,
    /// Language codes warmed for every route.
    pub languages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RevalidationSettings {
    pub enabled: bool,
    /// UTC hour of day (0-23) at which incremental entries go stale.
    pub hour: u8,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("RICORDO").separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    warmup: RawWarmupSettings,
    revalidation: RawRevalidationSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmupSettings {
    catalog_path: Option<PathBuf>,
    languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRevalidationSettings {
    enabled: Option<bool>,
    hour: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            warmup,
            revalidation,
            logging,
        } = raw;

        Ok(Self {
            cache: build_cache_settings(cache)?,
            warmup: build_warmup_settings(warmup)?,
            revalidation: build_revalidation_settings(revalidation)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.directory", "must not be empty"));
    }
    Ok(CacheSettings { directory })
}

fn build_warmup_settings(warmup: RawWarmupSettings) -> Result<WarmupSettings, LoadError> {
    let catalog_path = warmup
        .catalog_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH));

    let languages = warmup
        .languages
        .unwrap_or_else(|| vec![DEFAULT_LANGUAGE.to_string()]);
    if languages.is_empty() {
        return Err(LoadError::invalid(
            "warmup.languages",
            "at least one language is required",
        ));
    }
    if languages.iter().any(|lang| lang.trim().is_empty()) {
        return Err(LoadError::invalid(
            "warmup.languages",
            "language codes must not be blank",
        ));
    }

    Ok(WarmupSettings {
        catalog_path,
        languages,
    })
}

fn build_revalidation_settings(
    revalidation: RawRevalidationSettings,
) -> Result<RevalidationSettings, LoadError> {
    let hour = revalidation.hour.unwrap_or(DEFAULT_REVALIDATION_HOUR);
    if hour > 23 {
        return Err(LoadError::invalid(
            "revalidation.hour",
            format!("{hour} is not an hour of day (0-23)"),
        ));
    }
    Ok(RevalidationSettings {
        enabled: revalidation.enabled.unwrap_or(true),
        hour,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let settings = Settings::from_raw(RawSettings::default()).expect("settings");
        assert_eq!(settings.cache.directory, PathBuf::from("cache"));
        assert_eq!(settings.warmup.languages, vec!["en".to_string()]);
        assert!(settings.revalidation.enabled);
        assert_eq!(settings.revalidation.hour, 3);
        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
    }

    #[test]
    fn revalidation_hour_must_be_an_hour_of_day() {
        let raw = RawSettings {
            revalidation: RawRevalidationSettings {
                hour: Some(24),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key: "revalidation.hour", .. })
        ));
    }

    #[test]
    fn languages_must_not_be_blank() {
        let raw = RawSettings {
            warmup: RawWarmupSettings {
                languages: Some(vec!["en".to_string(), "  ".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Settings::from_raw(raw).is_err());

        let raw = RawSettings {
            warmup: RawWarmupSettings {
                languages: Some(Vec::new()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let raw = RawSettings {
            logging: RawLoggingSettings {
                level: Some("chatty".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn json_toggle_selects_format() {
        let raw = RawSettings {
            logging: RawLoggingSettings {
                json: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let settings = Settings::from_raw(raw).expect("settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }
}
