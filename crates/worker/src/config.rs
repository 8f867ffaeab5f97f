use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::{
    QueueConfig, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES, DEFAULT_RETENTION,
    DEFAULT_RETRY_BACKOFF,
};

/// Default sweeper period: 1 minute.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

const DEFAULT_FILTER: &str = "r";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string for the FITS metadata catalog.
    pub database_url: String,
    pub max_concurrent_jobs: usize,
    /// Retention window for terminal jobs and their result files.
    pub result_retention: Duration,
    pub sweep_interval: Duration,
    /// Retries after `StorageUnavailable` before a job fails.
    pub max_retries: u32,
    /// Base retry delay, doubled per attempt.
    pub retry_backoff: Duration,
    /// Directory cutout FITS files are written to.
    pub result_dir: PathBuf,
    /// Catalogued file names are resolved relative to this directory.
    pub image_root: PathBuf,
    /// Filter used when a request names none.
    pub default_filter: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default             |
    /// |---------------------------------|---------------------|
    /// | `DATABASE_URL`                  | required            |
    /// | `IMGSERV_MAX_CONCURRENT_JOBS`   | `4`                 |
    /// | `IMGSERV_RESULT_RETENTION_SECS` | `3600`              |
    /// | `IMGSERV_SWEEP_INTERVAL_SECS`   | `60`                |
    /// | `IMGSERV_MAX_RETRIES`           | `3`                 |
    /// | `IMGSERV_RETRY_BACKOFF_MS`      | `200`               |
    /// | `IMGSERV_RESULT_DIR`            | `<tmp>/imgserv`     |
    /// | `IMGSERV_IMAGE_ROOT`            | `.`                 |
    /// | `IMGSERV_DEFAULT_FILTER`        | `r`                 |
    ///
    /// Unparseable numbers fall back to the default with a warning.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let max_concurrent_jobs = env_or("IMGSERV_MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT);
        let result_retention = Duration::from_secs(env_or(
            "IMGSERV_RESULT_RETENTION_SECS",
            DEFAULT_RETENTION.as_secs(),
        ));
        let sweep_interval = Duration::from_secs(env_or(
            "IMGSERV_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL_SECS,
        ));
        let max_retries = env_or("IMGSERV_MAX_RETRIES", DEFAULT_MAX_RETRIES);
        let retry_backoff = Duration::from_millis(env_or(
            "IMGSERV_RETRY_BACKOFF_MS",
            DEFAULT_RETRY_BACKOFF.as_millis() as u64,
        ));

        let result_dir = std::env::var("IMGSERV_RESULT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("imgserv"));
        let image_root = std::env::var("IMGSERV_IMAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let default_filter =
            std::env::var("IMGSERV_DEFAULT_FILTER").unwrap_or_else(|_| DEFAULT_FILTER.into());

        Ok(Self {
            database_url,
            max_concurrent_jobs,
            result_retention,
            sweep_interval,
            max_retries,
            retry_backoff,
            result_dir,
            image_root,
            default_filter,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent_jobs,
            retention: self.result_retention,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(var = name, value = raw, %default, "Invalid value, using default");
            default
        }
    }
}
