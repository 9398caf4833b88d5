use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rand::Rng;
use reqwest::header::{COOKIE, USER_AGENT};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{CrawlError, Result};

pub const PTT_DOMAIN: &str = "https://www.ptt.cc";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// The board gates mature content behind this cookie.
const AGE_GATE_COOKIE: &str = "over18=1";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

/// A single non-retrying GET. Retries belong to the caller.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let user_agent = random_user_agent();
        debug!(url, user_agent, "GET");

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, user_agent)
            .header(COOKIE, AGE_GATE_COOKIE)
            .send()
            .await
            .map_err(|source| CrawlError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::PageNotFound {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|source| CrawlError::Transport {
            url: url.to_string(),
            source,
        })
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
        }
    }

    /// `base_backoff * 2^attempt`, capped at `MAX_BACKOFF`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }
}

/// Fetch with exponential backoff on transport and status failures.
pub async fn fetch_with_retry(fetcher: &dyn Fetch, url: &str, policy: RetryPolicy) -> Result<String> {
    let mut attempt = 0;
    loop {
        match fetcher.fetch(url).await {
            Ok(body) => return Ok(body),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Fetch failed for {} (attempt {}/{}): {}, backing off {:.1}s",
                    url,
                    attempt + 1,
                    policy.max_retries,
                    e,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Randomized delay between sequential requests of one actor.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    min: Duration,
    max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn next_delay(&self) -> Duration {
        if self.max.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::rng().random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
