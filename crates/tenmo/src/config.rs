//! Configuration loading from environment variables.

use std::time::Duration;

use crate::materializer::ConsistencyMode;
use crate::reclaimer::ReclaimerConfig;
use crate::worker::{WorkerConfig, DEFAULT_MAX_ATTEMPTS};

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store connection string.
    pub database_url: String,
    /// Claims allowed per event before it is abandoned.
    pub max_attempts: u32,
    /// How long a claim may stay unfinalized before it is reclaimed.
    pub lease_timeout: Duration,
    /// Pause between lease sweeps.
    pub reclaim_interval: Duration,
    /// Longest idle wait between worker polls.
    pub poll_interval: Duration,
    pub consistency: ConsistencyMode,
    /// Number of concurrent workers.
    pub workers: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TENMO_DATABASE_URL`: store connection string
    ///
    /// Optional (with defaults):
    /// - `TENMO_MAX_ATTEMPTS` (50)
    /// - `TENMO_LEASE_TIMEOUT_MS` (5000)
    /// - `TENMO_RECLAIM_INTERVAL_MS` (5000)
    /// - `TENMO_POLL_INTERVAL_MS` (30000)
    /// - `TENMO_CONSISTENCY`: `lenient` or `strict` (lenient)
    /// - `TENMO_WORKERS` (1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TENMO_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TENMO_DATABASE_URL"))?;

        let max_attempts: u32 = parse_var(
            "TENMO_MAX_ATTEMPTS",
            DEFAULT_MAX_ATTEMPTS,
            "must be a positive integer",
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "TENMO_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        let lease_timeout_ms: u64 =
            parse_var("TENMO_LEASE_TIMEOUT_MS", 5_000, "must be a duration in milliseconds")?;
        let reclaim_interval_ms: u64 = parse_var(
            "TENMO_RECLAIM_INTERVAL_MS",
            5_000,
            "must be a duration in milliseconds",
        )?;
        let poll_interval_ms: u64 =
            parse_var("TENMO_POLL_INTERVAL_MS", 30_000, "must be a duration in milliseconds")?;

        let consistency = match std::env::var("TENMO_CONSISTENCY") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("TENMO_CONSISTENCY", "must be 'strict' or 'lenient'")
            })?,
            Err(_) => ConsistencyMode::Lenient,
        };

        let workers: usize = parse_var("TENMO_WORKERS", 1, "must be a positive integer")?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                "TENMO_WORKERS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            max_attempts,
            lease_timeout: Duration::from_millis(lease_timeout_ms),
            reclaim_interval: Duration::from_millis(reclaim_interval_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            consistency,
            workers,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_attempts: self.max_attempts,
            poll_interval: self.poll_interval,
            mode: self.consistency,
        }
    }

    pub fn reclaimer_config(&self) -> ReclaimerConfig {
        ReclaimerConfig {
            interval: self.reclaim_interval,
            lease_timeout: self.lease_timeout,
            max_attempts: self.max_attempts,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
