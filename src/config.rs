//! Service configuration
//!
//! Read from environment variables at startup; every option has a default.

use std::net::SocketAddr;
use std::time::Duration;

use crate::detector::DetectorConfig;
use crate::dispatch::DispatcherConfig;
use crate::domain::DEFAULT_THRESHOLD;
use crate::infra::{InventoryError, Result, RetryConfig};
use crate::ingest::ApplierConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub max_connections: u32,

    /// Low-stock threshold in units
    pub threshold: u64,

    pub dispatch_max_attempts: u32,
    pub dispatch_backoff_base: Duration,
    pub dispatch_backoff_max: Duration,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,

    pub consumer_id: String,
    pub detector_batch_size: usize,
    pub detector_poll_interval: Duration,

    pub ingest_concurrency: usize,

    /// Comma-separated allowed origins, `*` for any; CORS is off when unset
    pub cors_allow_origins: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://inventory.db?mode=rwc".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 5,
            threshold: DEFAULT_THRESHOLD,
            dispatch_max_attempts: 5,
            dispatch_backoff_base: Duration::from_millis(200),
            dispatch_backoff_max: Duration::from_secs(30),
            dedup_window: Duration::from_secs(3600),
            dedup_max_entries: 100_000,
            consumer_id: "low-stock-detector".to_string(),
            detector_batch_size: 100,
            detector_poll_interval: Duration::from_millis(500),
            ingest_concurrency: 16,
            cors_allow_origins: None,
        }
    }
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_or(&lookup, "PORT", 8080)?;
        let listen_addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
            InventoryError::Configuration(format!("invalid listen address {host}:{port}: {e}"))
        })?;

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            listen_addr,
            max_connections: parse_or(&lookup, "MAX_DB_CONNECTIONS", defaults.max_connections)?,
            threshold: parse_or(&lookup, "LOW_STOCK_THRESHOLD", defaults.threshold)?,
            dispatch_max_attempts: parse_or(
                &lookup,
                "DISPATCH_MAX_ATTEMPTS",
                defaults.dispatch_max_attempts,
            )?,
            dispatch_backoff_base: Duration::from_millis(parse_or(
                &lookup,
                "DISPATCH_BACKOFF_BASE_MS",
                defaults.dispatch_backoff_base.as_millis() as u64,
            )?),
            dispatch_backoff_max: Duration::from_millis(parse_or(
                &lookup,
                "DISPATCH_BACKOFF_MAX_MS",
                defaults.dispatch_backoff_max.as_millis() as u64,
            )?),
            dedup_window: Duration::from_secs(parse_or(
                &lookup,
                "DEDUP_WINDOW_SECS",
                defaults.dedup_window.as_secs(),
            )?),
            dedup_max_entries: parse_or(&lookup, "DEDUP_MAX_ENTRIES", defaults.dedup_max_entries)?,
            consumer_id: lookup("DETECTOR_CONSUMER_ID").unwrap_or(defaults.consumer_id),
            detector_batch_size: parse_or(
                &lookup,
                "DETECTOR_BATCH_SIZE",
                defaults.detector_batch_size,
            )?,
            detector_poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "DETECTOR_POLL_INTERVAL_MS",
                defaults.detector_poll_interval.as_millis() as u64,
            )?),
            ingest_concurrency: parse_or(&lookup, "INGEST_CONCURRENCY", defaults.ingest_concurrency)?,
            cors_allow_origins: lookup("CORS_ALLOW_ORIGINS").filter(|v| !v.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(InventoryError::Configuration(msg.to_string()));

        if self.database_url.trim().is_empty() {
            return invalid("DATABASE_URL must not be empty");
        }
        if self.threshold == 0 {
            return invalid("LOW_STOCK_THRESHOLD must be at least 1");
        }
        if self.dispatch_max_attempts == 0 {
            return invalid("DISPATCH_MAX_ATTEMPTS must be at least 1");
        }
        if self.dispatch_backoff_base > self.dispatch_backoff_max {
            return invalid("DISPATCH_BACKOFF_BASE_MS must not exceed DISPATCH_BACKOFF_MAX_MS");
        }
        if self.dedup_window.is_zero() {
            return invalid("DEDUP_WINDOW_SECS must be greater than 0");
        }
        if self.dedup_max_entries == 0 {
            return invalid("DEDUP_MAX_ENTRIES must be greater than 0");
        }
        if self.consumer_id.trim().is_empty() {
            return invalid("DETECTOR_CONSUMER_ID must not be empty");
        }
        if self.detector_batch_size == 0 {
            return invalid("DETECTOR_BATCH_SIZE must be greater than 0");
        }
        if self.max_connections == 0 {
            return invalid("MAX_DB_CONNECTIONS must be greater than 0");
        }
        if self.ingest_concurrency == 0 {
            return invalid("INGEST_CONCURRENCY must be greater than 0");
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: self.dispatch_max_attempts,
            backoff_base: self.dispatch_backoff_base,
            backoff_max: self.dispatch_backoff_max,
            dedup_window: self.dedup_window,
            dedup_max_entries: self.dedup_max_entries,
        }
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            consumer_id: self.consumer_id.clone(),
            threshold: self.threshold,
            batch_size: self.detector_batch_size,
            poll_interval: self.detector_poll_interval,
            ..DetectorConfig::default()
        }
    }

    pub fn applier(&self) -> ApplierConfig {
        ApplierConfig {
            concurrency: self.ingest_concurrency,
            retry: RetryConfig::database(),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            InventoryError::Configuration(format!("invalid {key}={raw:?}: {e}"))
        }),
        None => Ok(default),
    }
}
