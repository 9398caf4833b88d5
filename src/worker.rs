use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::db::{ArticleRecord, ArticleStore};
use crate::error::{CrawlError, Result};
use crate::fetcher::{fetch_with_retry, Fetch, Pacing, RetryPolicy};
use crate::parser::article::parse_article_page;
use crate::queue::{ClaimedTask, CrawlTask, TaskSource};

static ARTICLE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://www\.ptt\.cc/bbs/([A-Za-z0-9_-]+)/(M\.\d+\.A\.[0-9A-Fa-f]{3})\.html$")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Persisted {
        board: String,
        article_id: String,
        truncated: Vec<&'static str>,
    },
    Discarded {
        reason: String,
    },
}

pub fn validate_article_url(url: &str) -> Result<(String, String)> {
    let caps = ARTICLE_URL_RE
        .captures(url)
        .ok_or_else(|| CrawlError::InvalidTaskInput(url.to_string()))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// Fetch, parse and upsert one article. Rejects foreign URLs before touching the network.
pub async fn process_task(
    fetcher: &dyn Fetch,
    store: &dyn ArticleStore,
    task: &CrawlTask,
    retry: RetryPolicy,
) -> Result<TaskOutcome> {
    let url = task.article_url.as_str();
    validate_article_url(url)?;

    let markup = fetch_with_retry(fetcher, url, retry).await?;
    let page = parse_article_page(&markup, url)?;

    if page.title.is_empty() {
        debug!(url, "Article has no title, discarding");
        return Ok(TaskOutcome::Discarded {
            reason: "empty title".into(),
        });
    }

    let record = ArticleRecord::from_page(&page, today());
    let outcome = store.upsert_article(&record)?;
    debug!(
        board = %record.board,
        article_id = %record.article_id,
        pushes = record.pushes_all,
        "Stored article"
    );
    Ok(TaskOutcome::Persisted {
        board: record.board,
        article_id: record.article_id,
        truncated: outcome.truncated,
    })
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

// ── Pool ──

/// Consecutive busy/locked claim errors tolerated before the pool gives up.
const MAX_CLAIM_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub pacing: Pacing,
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub processed: usize,
    pub persisted: usize,
    pub discarded: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// Drains the task queue with bounded concurrency.
pub struct WorkerPool {
    fetcher: Arc<dyn Fetch>,
    store: Arc<dyn ArticleStore>,
    source: Arc<dyn TaskSource>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        store: Arc<dyn ArticleStore>,
        source: Arc<dyn TaskSource>,
        config: PoolConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            source,
            config,
        }
    }

    /// With `drain`, returns once the queue is empty; otherwise polls until Ctrl-C.
    pub async fn run(&self, drain: bool) -> Result<PoolStats> {
        self.run_until(drain, async {
            // Without a signal handler there is nothing to wait for.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like `run`, stopping as soon as `shutdown` resolves, even mid-batch.
    /// Tasks cut off this way stay `running` until the queue's stale recovery.
    pub async fn run_until(
        &self,
        drain: bool,
        shutdown: impl Future<Output = ()>,
    ) -> Result<PoolStats> {
        tokio::pin!(shutdown);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        let mut stats = PoolStats::default();
        let mut claim_failures = 0u32;
        'pool: loop {
            let batch = match self.source.claim_batch(self.config.concurrency * 2) {
                Ok(batch) => {
                    claim_failures = 0;
                    batch
                }
                Err(e) if e.is_retryable() && claim_failures < MAX_CLAIM_FAILURES => {
                    claim_failures += 1;
                    let backoff = self.config.retry.backoff(claim_failures);
                    warn!(
                        "Claim failed (attempt {}/{}): {}, backing off {:.1}s",
                        claim_failures,
                        MAX_CLAIM_FAILURES,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = &mut shutdown => break,
                    }
                }
                Err(e) => return Err(e),
            };
            if batch.is_empty() {
                if drain {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    _ = &mut shutdown => break,
                }
            }
            pb.inc_length(batch.len() as u64);

            // Workers send results, this loop records them against the queue.
            let (tx, mut rx) = tokio::sync::mpsc::channel::<(ClaimedTask, Result<TaskOutcome>)>(
                self.config.concurrency * 2,
            );
            for claimed in batch {
                let fetcher = Arc::clone(&self.fetcher);
                let store = Arc::clone(&self.store);
                let sem = Arc::clone(&semaphore);
                let tx = tx.clone();
                let retry = self.config.retry;
                let pacing = self.config.pacing;

                tokio::spawn(async move {
                    let Ok(_permit) = sem.acquire().await else {
                        return;
                    };
                    pacing.pause().await;
                    let result =
                        process_task(fetcher.as_ref(), store.as_ref(), &claimed.task, retry).await;
                    let _ = tx.send((claimed, result)).await;
                });
            }
            // Drop our copy of tx so rx closes when the batch is done
            drop(tx);

            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some((claimed, result)) => {
                            self.settle(&claimed, result, &mut stats)?;
                            pb.inc(1);
                        }
                        None => break,
                    },
                    _ = &mut shutdown => break 'pool,
                }
            }
        }

        pb.finish_and_clear();
        info!(
            processed = stats.processed,
            persisted = stats.persisted,
            discarded = stats.discarded,
            requeued = stats.requeued,
            failed = stats.failed,
            "Worker pool stopped"
        );
        Ok(stats)
    }

    fn settle(
        &self,
        claimed: &ClaimedTask,
        result: Result<TaskOutcome>,
        stats: &mut PoolStats,
    ) -> Result<()> {
        stats.processed += 1;
        let url = &claimed.task.article_url;
        match result {
            Ok(TaskOutcome::Persisted { .. }) => {
                stats.persisted += 1;
                self.source.ack(claimed.id)
            }
            Ok(TaskOutcome::Discarded { reason }) => {
                debug!(url = %url, reason = %reason, "Discarded");
                stats.discarded += 1;
                self.source.ack(claimed.id)
            }
            Err(e) if e.is_retryable() => {
                let requeued =
                    self.source
                        .retry(claimed.id, &e.to_string(), self.config.max_attempts)?;
                if requeued {
                    warn!(url = %url, attempt = claimed.attempts, error = %e, "Requeued");
                    stats.requeued += 1;
                } else {
                    warn!(url = %url, attempts = claimed.attempts, error = %e, "Giving up");
                    stats.failed += 1;
                }
                Ok(())
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Task failed");
                stats.failed += 1;
                self.source.fail(claimed.id, &e.to_string())
            }
        }
    }
}
