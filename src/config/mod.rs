//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

use crate::domain::types::{BusinessType, EntityType, OrderStatus};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "kasirpro";
const ENV_PREFIX: &str = "KASIRPRO";
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_ENTRIES: usize = 256;
const DEFAULT_ORDERS_TTL_MS: u64 = 30_000;
const DEFAULT_CUSTOMERS_TTL_MS: u64 = 60_000;
const DEFAULT_SERVICES_TTL_MS: u64 = 300_000;
const DEFAULT_PRODUCTS_TTL_MS: u64 = 120_000;
const DEFAULT_FRESH_READ_MS: u64 = 10_000;
const DEFAULT_HISTORY_STALENESS_MS: u64 = 5_000;
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 15_000;
/// Longest accepted duration for any cache setting: thirty days.
const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Command-line arguments for the KasirPro cache client.
#[derive(Debug, Parser)]
#[command(name = "kasirpro", version, about = "KasirPro collection cache client")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KASIRPRO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the backend adapter.
    #[arg(long = "backend", value_name = "KIND", global = true)]
    pub backend: Option<BackendKind>,

    /// Override the backend base URL.
    #[arg(long = "backend-url", value_name = "URL", global = true)]
    pub backend_url: Option<String>,

    /// Disable cache reads; every load goes to the backend.
    #[arg(long = "no-cache", action = clap::ArgAction::SetTrue, global = true)]
    pub no_cache: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Load one collection and print it.
    List(ListArgs),
    /// Keep a collection mounted and print every refresh.
    Watch(WatchArgs),
    /// Print one page of order history.
    History(HistoryArgs),
    /// Run a scripted session against the in-memory backend.
    Demo(DemoArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ScopeArgs {
    /// Owner (authenticated user id) whose rows are read.
    #[arg(long, value_name = "UUID")]
    pub owner: Uuid,

    /// Business vertical partition (laundry|warung|cuci_motor).
    #[arg(long = "business-type", value_name = "TYPE")]
    pub business_type: Option<BusinessType>,
}

#[derive(Debug, Args, Clone)]
pub struct ListArgs {
    /// Collection to load (orders|customers|services|products).
    pub entity: EntityType,

    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Bypass any cached snapshot.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    /// Collection to watch (orders|customers|services|products).
    pub entity: EntityType,

    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Stop after this many seconds; runs until Ctrl-C when omitted.
    #[arg(long = "for-seconds", value_name = "SECONDS")]
    pub for_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long = "page-size", default_value_t = crate::application::pagination::DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    /// Only orders with this status.
    #[arg(long, value_name = "STATUS")]
    pub status: Option<OrderStatus>,

    /// Case-insensitive customer name search.
    #[arg(long, value_name = "TEXT")]
    pub search: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    /// Orders to create during the session.
    #[arg(long, default_value_t = 3)]
    pub orders: u32,

    /// Daily transaction limit enforced by the in-memory backend.
    #[arg(long = "daily-limit", value_name = "COUNT")]
    pub daily_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local tables, for demos and tests.
    Memory,
    /// PostgREST-style HTTP backend.
    Rest,
}

/// Fully resolved application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: NonZeroUsize,
    pub orders_ttl: Duration,
    pub customers_ttl: Duration,
    pub services_ttl: Duration,
    pub products_ttl: Duration,
    pub fresh_read: Duration,
    pub history_staleness: Duration,
    pub reconnect_interval: Duration,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(kind) = overrides.backend {
            self.backend.kind = Some(kind);
        }
        if let Some(url) = overrides.backend_url.as_ref() {
            self.backend.url = Some(url.clone());
        }
        if overrides.no_cache {
            self.cache.enabled = Some(false);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            backend,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            backend: build_backend_settings(backend)?,
            cache: build_cache_settings(cache)?,
        })
    }
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

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let kind = backend.kind.unwrap_or(BackendKind::Memory);
    let url = non_empty(backend.url);
    let api_key = non_empty(backend.api_key);
    let access_token = non_empty(backend.access_token);

    if kind == BackendKind::Rest {
        let Some(raw_url) = url.as_deref() else {
            return Err(LoadError::invalid("backend.url", "required for the rest backend"));
        };
        url::Url::parse(raw_url)
            .map_err(|err| LoadError::invalid("backend.url", format!("invalid url: {err}")))?;
        if api_key.is_none() {
            return Err(LoadError::invalid(
                "backend.api_key",
                "required for the rest backend",
            ));
        }
    }

    let timeout_secs = backend
        .timeout_seconds
        .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "backend.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(BackendSettings {
        kind,
        url,
        api_key,
        access_token,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = NonZeroUsize::new(cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES))
        .ok_or_else(|| LoadError::invalid("cache.max_entries", "must be greater than zero"))?;

    let fresh_read = positive_millis(
        cache.fresh_read_ms.unwrap_or(DEFAULT_FRESH_READ_MS),
        "cache.fresh_read_ms",
    )?;
    let orders_ttl = positive_millis(
        cache.orders_ttl_ms.unwrap_or(DEFAULT_ORDERS_TTL_MS),
        "cache.orders_ttl_ms",
    )?;
    let customers_ttl = positive_millis(
        cache.customers_ttl_ms.unwrap_or(DEFAULT_CUSTOMERS_TTL_MS),
        "cache.customers_ttl_ms",
    )?;
    let services_ttl = positive_millis(
        cache.services_ttl_ms.unwrap_or(DEFAULT_SERVICES_TTL_MS),
        "cache.services_ttl_ms",
    )?;
    let products_ttl = positive_millis(
        cache.products_ttl_ms.unwrap_or(DEFAULT_PRODUCTS_TTL_MS),
        "cache.products_ttl_ms",
    )?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        max_entries,
        orders_ttl,
        customers_ttl,
        services_ttl,
        products_ttl,
        fresh_read,
        history_staleness: positive_millis(
            cache
                .history_staleness_ms
                .unwrap_or(DEFAULT_HISTORY_STALENESS_MS),
            "cache.history_staleness_ms",
        )?,
        reconnect_interval: positive_millis(
            cache
                .reconnect_interval_ms
                .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS),
            "cache.reconnect_interval_ms",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<BackendKind>,
    url: Option<String>,
    api_key: Option<String>,
    access_token: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    max_entries: Option<usize>,
    orders_ttl_ms: Option<u64>,
    customers_ttl_ms: Option<u64>,
    services_ttl_ms: Option<u64>,
    products_ttl_ms: Option<u64>,
    fresh_read_ms: Option<u64>,
    history_staleness_ms: Option<u64>,
    reconnect_interval_ms: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    if value > MAX_DURATION_MS {
        return Err(LoadError::invalid(
            key,
            format!("must not exceed {MAX_DURATION_MS} ms (30 days)"),
        ));
    }
    Ok(Duration::from_millis(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
