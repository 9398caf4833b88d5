use std::sync::Arc;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CrawlError, Result};
use crate::fetcher::{fetch_with_retry, Fetch, Pacing, RetryPolicy};
use crate::parser::list_page::{parse_list_page, ListPage};
use crate::parser::list_page_url;

/// Page walked when the newest index cannot be resolved.
pub const DEFAULT_START_INDEX: u32 = 1;

#[derive(Debug, Clone)]
pub struct WalkPlan {
    pub board: String,
    /// `None` starts from the board's newest page.
    pub start_index: Option<u32>,
    /// `None` disables the recency cutoff.
    pub target_days: Option<u32>,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WalkReport {
    pub board: String,
    pub newest_index: u32,
    pub urls: Vec<String>,
    pub pages_processed: u32,
    pub articles_found: usize,
    pub pinned_skipped: usize,
    pub old_skipped: usize,
    pub removed_skipped: usize,
    pub date_parse_failures: usize,
    pub failed_pages: Vec<u32>,
}

/// Walks a board's list pages from newer to older, collecting in-range article URLs.
pub struct PaginationWalker {
    fetcher: Arc<dyn Fetch>,
    retry: RetryPolicy,
    pacing: Pacing,
}

impl PaginationWalker {
    pub fn new(fetcher: Arc<dyn Fetch>, retry: RetryPolicy, pacing: Pacing) -> Self {
        Self {
            fetcher,
            retry,
            pacing,
        }
    }

    pub async fn walk(&self, plan: &WalkPlan, now: NaiveDateTime) -> WalkReport {
        let mut report = WalkReport {
            board: plan.board.clone(),
            ..Default::default()
        };

        // The newest page doubles as the first page of the walk.
        let (mut index, mut first_page) = match plan.start_index {
            Some(i) => (i, None),
            None => match self.fetch_page(&plan.board, None).await {
                Ok(page) => (page.index, Some(page)),
                Err(e) => {
                    warn!(
                        board = %plan.board,
                        error = %e,
                        "Cannot resolve newest page, starting from page {}",
                        DEFAULT_START_INDEX
                    );
                    (DEFAULT_START_INDEX, None)
                }
            },
        };
        report.newest_index = index;

        let today = now.date();
        let cutoff = plan
            .target_days
            .and_then(|days| today.checked_sub_days(Days::new(days.into())));

        let mut attempted = 0u32;
        while index > 0 && plan.max_pages.map_or(true, |max| attempted < max) {
            let page = match first_page.take() {
                Some(page) => Ok(page),
                None => {
                    if attempted > 0 {
                        self.pacing.pause().await;
                    }
                    self.fetch_page(&plan.board, Some(index)).await
                }
            };
            attempted += 1;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(board = %plan.board, index, error = %e, "Skipping list page");
                    report.failed_pages.push(index);
                    index -= 1;
                    continue;
                }
            };

            report.pages_processed += 1;
            let old_on_page = collect_in_range(&page, today, cutoff, &mut report);
            info!(
                board = %plan.board,
                index,
                urls = report.urls.len(),
                old = old_on_page,
                "Walked list page"
            );

            // Boards are chronological: anything older than an old article is old too.
            if old_on_page > 0 {
                break;
            }
            index -= 1;
        }

        info!(
            board = %report.board,
            pages = report.pages_processed,
            articles = report.articles_found,
            old_skipped = report.old_skipped,
            pinned_skipped = report.pinned_skipped,
            failed = report.failed_pages.len(),
            "Walk finished"
        );
        report
    }

    async fn fetch_page(&self, board: &str, index: Option<u32>) -> Result<ListPage> {
        let url = list_page_url(board, index);
        let markup = fetch_with_retry(self.fetcher.as_ref(), &url, self.retry).await?;
        parse_list_page(&markup, &url)
    }
}

/// Append the page's in-range URLs to the report. Returns how many were too old.
fn collect_in_range(
    page: &ListPage,
    today: NaiveDate,
    cutoff: Option<NaiveDate>,
    report: &mut WalkReport,
) -> usize {
    report.pinned_skipped += page.pinned_skipped;
    let mut old = 0;
    for summary in &page.summaries {
        if summary.is_removed || summary.url.is_empty() {
            report.removed_skipped += 1;
            continue;
        }
        match resolve_short_date(&summary.date, today) {
            Ok(date) if cutoff.is_some_and(|c| date < c) => {
                debug!(url = %summary.url, %date, "Older than cutoff");
                old += 1;
                continue;
            }
            Ok(date) => debug!(url = %summary.url, %date, score = summary.score_value(), "In range"),
            Err(e) => {
                warn!(url = %summary.url, error = %e, "Keeping article with unreadable date");
                report.date_parse_failures += 1;
            }
        }
        report.urls.push(summary.url.clone());
        report.articles_found += 1;
    }
    report.old_skipped += old;
    old
}

/// Resolve a list page `M/DD` date against `today`. Dates that would land after
/// today belong to the previous year.
pub fn resolve_short_date(raw: &str, today: NaiveDate) -> Result<NaiveDate> {
    let parse_err = || CrawlError::DateParse { raw: raw.to_string() };
    let (month, day) = raw.trim().split_once('/').ok_or_else(parse_err)?;
    let month: u32 = month.trim().parse().map_err(|_| parse_err())?;
    let day: u32 = day.trim().parse().map_err(|_| parse_err())?;

    match NaiveDate::from_ymd_opt(today.year(), month, day) {
        Some(date) if date <= today => Ok(date),
        _ => NaiveDate::from_ymd_opt(today.year() - 1, month, day).ok_or_else(parse_err),
    }
}
