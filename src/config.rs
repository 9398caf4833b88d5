use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::error::{CrawlError, Result};
use crate::fetcher::{Pacing, RetryPolicy};

/// Runtime settings, read from `.env` and `PTT_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub board: String,
    pub delay_min: f64,
    pub delay_max: f64,
    pub timeout_secs: u64,
    pub db_path: PathBuf,
    pub worker_concurrency: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let settings: Settings = Config::builder()
            .set_default("board", "Drink")
            .and_then(|b| b.set_default("delay_min", 0.5))
            .and_then(|b| b.set_default("delay_max", 1.5))
            .and_then(|b| b.set_default("timeout_secs", 10))
            .and_then(|b| b.set_default("db_path", "data/ptt.sqlite"))
            .and_then(|b| b.set_default("worker_concurrency", 4))
            .and_then(|b| b.set_default("max_retries", 3))
            .and_then(|b| b.set_default("backoff_ms", 2000))
            .and_then(|b| b.set_default("max_attempts", 3))
            .and_then(|b| b.set_default("poll_interval_secs", 5))
            .map_err(|e| CrawlError::Config(e.to_string()))?
            .add_source(Environment::with_prefix("PTT").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.delay_min < 0.0 || self.delay_max < self.delay_min {
            return Err(CrawlError::Config(format!(
                "delay range {}..{} is not a valid interval",
                self.delay_min, self.delay_max
            )));
        }
        if self.worker_concurrency == 0 {
            return Err(CrawlError::Config("worker_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pacing(&self) -> Pacing {
        Pacing::new(
            Duration::from_secs_f64(self.delay_min),
            Duration::from_secs_f64(self.delay_max),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.backoff_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
