use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::queue::TaskHandle;
use crate::walker::{PaginationWalker, WalkPlan, WalkReport};

#[derive(Debug, Serialize)]
pub struct CrawlOutcome {
    pub report: WalkReport,
    pub handles: Vec<TaskHandle>,
}

/// Walk back from the newest page until articles fall outside `target_days`, then queue them.
pub async fn trigger_recent_crawl(
    walker: &PaginationWalker,
    dispatcher: &Dispatcher,
    board: &str,
    target_days: u32,
    max_pages: Option<u32>,
) -> Result<CrawlOutcome> {
    let plan = WalkPlan {
        board: board.to_string(),
        start_index: None,
        target_days: Some(target_days),
        max_pages,
    };
    walk_and_dispatch(walker, dispatcher, &plan, Local::now().naive_local()).await
}

/// Queue the articles of one list page.
pub async fn trigger_single_page_crawl(
    walker: &PaginationWalker,
    dispatcher: &Dispatcher,
    board: &str,
    page_index: u32,
    target_days: Option<u32>,
) -> Result<CrawlOutcome> {
    let plan = WalkPlan {
        board: board.to_string(),
        start_index: Some(page_index),
        target_days,
        max_pages: Some(1),
    };
    walk_and_dispatch(walker, dispatcher, &plan, Local::now().naive_local()).await
}

async fn walk_and_dispatch(
    walker: &PaginationWalker,
    dispatcher: &Dispatcher,
    plan: &WalkPlan,
    now: NaiveDateTime,
) -> Result<CrawlOutcome> {
    info!(
        board = %plan.board,
        start = ?plan.start_index,
        target_days = ?plan.target_days,
        max_pages = ?plan.max_pages,
        "Starting crawl"
    );
    let report = walker.walk(plan, now).await;
    let handles = dispatcher.dispatch(&report.urls)?;
    Ok(CrawlOutcome { report, handles })
}
