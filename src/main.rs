mod config;
mod crawl;
mod db;
mod dispatcher;
mod error;
mod export;
mod fetcher;
mod parser;
mod queue;
mod walker;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::crawl::CrawlOutcome;
use crate::dispatcher::Dispatcher;
use crate::fetcher::{Fetch, HttpFetcher};
use crate::queue::{CrawlTask, SqliteQueue};
use crate::walker::{PaginationWalker, WalkReport};
use crate::worker::{PoolConfig, TaskOutcome, WorkerPool};

#[derive(Parser)]
#[command(name = "ptt_crawler", about = "PTT board crawler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the article and task tables
    Init,
    /// Walk back from the newest page and queue recent articles
    Crawl {
        /// Board name (default: PTT_BOARD or Drink)
        #[arg(short, long)]
        board: Option<String>,
        /// Keep articles from the last N days
        #[arg(short, long, default_value = "30")]
        days: u32,
        /// Stop after this many list pages
        #[arg(short = 'n', long)]
        max_pages: Option<u32>,
        /// Drain the queue with a worker pool right after dispatching
        #[arg(long)]
        work: bool,
        /// Print the walk report and task handles as JSON
        #[arg(long)]
        json: bool,
    },
    /// Queue the articles of a single list page
    Page {
        /// List page index (indexN.html)
        index: u32,
        #[arg(short, long)]
        board: Option<String>,
        /// Only keep articles from the last N days
        #[arg(short, long)]
        days: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Fetch and store one article immediately, bypassing the queue
    Article {
        url: String,
        /// Print the parsed article instead of storing it
        #[arg(long)]
        dry_run: bool,
        /// With --dry-run, print the parsed article as JSON
        #[arg(long, requires = "dry_run")]
        json: bool,
    },
    /// Process queued article tasks
    Work {
        /// Exit once the queue is empty instead of polling
        #[arg(long)]
        drain: bool,
        /// Concurrent article fetches (default: PTT_WORKER_CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
    /// Write stored articles to CSV
    Export {
        /// Only export this board
        #[arg(short, long)]
        board: Option<String>,
        /// Output directory
        #[arg(short, long, default_value = "data")]
        out: PathBuf,
    },
    /// Show article and queue statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.db_path)?;
            db::ensure_schema(&conn)?;
            println!("Schema ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Crawl {
            board,
            days,
            max_pages,
            work,
            json,
        } => {
            let board = board.unwrap_or_else(|| settings.board.clone());
            let fetcher = http_fetcher(&settings)?;
            let queue = open_queue(&settings)?;
            let walker = build_walker(&settings, fetcher.clone());
            let dispatcher = Dispatcher::new(queue.clone());

            let outcome =
                crawl::trigger_recent_crawl(&walker, &dispatcher, &board, days, max_pages).await?;
            print_outcome(&outcome, json)?;

            if work {
                run_pool(&settings, fetcher, queue, None, true).await?;
            }
            Ok(())
        }
        Commands::Page {
            index,
            board,
            days,
            json,
        } => {
            let board = board.unwrap_or_else(|| settings.board.clone());
            let fetcher = http_fetcher(&settings)?;
            let queue = open_queue(&settings)?;
            let walker = build_walker(&settings, fetcher);
            let dispatcher = Dispatcher::new(queue);

            let outcome =
                crawl::trigger_single_page_crawl(&walker, &dispatcher, &board, index, days).await?;
            print_outcome(&outcome, json)?;
            Ok(())
        }
        Commands::Article { url, dry_run, json } => {
            let fetcher = http_fetcher(&settings)?;
            if dry_run {
                worker::validate_article_url(&url)?;
                let markup =
                    fetcher::fetch_with_retry(&*fetcher, &url, settings.retry_policy()).await?;
                let page = parser::article::parse_article_page(&markup, &url)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&page)?);
                    return Ok(());
                }
                println!("{} [{}]", page.title, page.category);
                println!(
                    "Author: {} ({})  IP: {}  Date: {}",
                    page.author_account, page.author_nickname, page.ip, page.timestamp_raw
                );
                println!(
                    "Pushes: {} ({} 推, {} 噓, {} →), score {}",
                    page.push_stats.total,
                    page.push_stats.approve,
                    page.push_stats.disapprove,
                    page.push_stats.neutral,
                    page.push_stats.score
                );
                for line in page.push_stats.summary_lines() {
                    println!("  {}", line);
                }
                return Ok(());
            }

            let store = open_store(&settings)?;
            let task = CrawlTask { article_url: url };
            let outcome =
                worker::process_task(&*fetcher, &*store, &task, settings.retry_policy()).await?;
            match outcome {
                TaskOutcome::Persisted {
                    board,
                    article_id,
                    truncated,
                } => {
                    if let Some(row) = store.fetch_article(&board, &article_id)? {
                        println!("Stored {}/{}: {}", board, article_id, row.title);
                        println!(
                            "  {} pushes, score {}, crawled {}",
                            row.pushes_all, row.pushes_score, row.crawl_date
                        );
                    }
                    if !truncated.is_empty() {
                        println!("Truncated columns: {}", truncated.join(", "));
                    }
                }
                TaskOutcome::Discarded { reason } => println!("Discarded: {}", reason),
            }
            Ok(())
        }
        Commands::Work { drain, concurrency } => {
            let fetcher = http_fetcher(&settings)?;
            let queue = open_queue(&settings)?;
            queue.recover_stale()?;
            let pending = queue.pending_count()?;
            if drain && pending == 0 {
                println!("No pending tasks. Run 'crawl' or 'page' first.");
                return Ok(());
            }
            println!("Working through {} pending tasks...", pending);
            run_pool(&settings, fetcher, queue, concurrency, drain).await?;
            Ok(())
        }
        Commands::Export { board, out } => {
            let store = open_store(&settings)?;
            let summary = export::export_articles(&store, board.as_deref(), &out)?;
            println!("Exported {} rows", summary.rows);
            println!("  {}", summary.path.display());
            println!("  {}", summary.latest_path.display());
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::ensure_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Articles: {}", s.articles);
            println!("Boards:   {}", s.boards);
            println!("Pending:  {}", s.pending);
            println!("Running:  {}", s.running);
            println!("Done:     {}", s.done);
            println!("Failed:   {}", s.failed);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn http_fetcher(settings: &Settings) -> anyhow::Result<Arc<dyn Fetch>> {
    Ok(Arc::new(HttpFetcher::new(settings.timeout())?))
}

fn build_walker(settings: &Settings, fetcher: Arc<dyn Fetch>) -> PaginationWalker {
    PaginationWalker::new(fetcher, settings.retry_policy(), settings.pacing())
}

fn open_queue(settings: &Settings) -> anyhow::Result<Arc<SqliteQueue>> {
    let conn = db::connect(&settings.db_path)?;
    db::ensure_schema(&conn)?;
    Ok(Arc::new(SqliteQueue::new(conn)))
}

fn open_store(settings: &Settings) -> anyhow::Result<Arc<db::SqliteStore>> {
    let store = db::SqliteStore::open(&settings.db_path)?;
    store.ensure_schema()?;
    Ok(Arc::new(store))
}

async fn run_pool(
    settings: &Settings,
    fetcher: Arc<dyn Fetch>,
    queue: Arc<SqliteQueue>,
    concurrency: Option<usize>,
    drain: bool,
) -> anyhow::Result<()> {
    let store = open_store(settings)?;
    let config = PoolConfig {
        concurrency: concurrency.unwrap_or(settings.worker_concurrency).max(1),
        retry: settings.retry_policy(),
        pacing: settings.pacing(),
        max_attempts: settings.max_attempts,
        poll_interval: settings.poll_interval(),
    };
    let stats = WorkerPool::new(fetcher, store, queue, config).run(drain).await?;
    println!(
        "Processed {} tasks ({} stored, {} discarded, {} requeued, {} failed).",
        stats.processed, stats.persisted, stats.discarded, stats.requeued, stats.failed
    );
    Ok(())
}

fn print_outcome(outcome: &CrawlOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        print_report(&outcome.report);
        println!("Queued {} article tasks.", outcome.handles.len());
    }
    Ok(())
}

fn print_report(report: &WalkReport) {
    println!(
        "Board {}: walked {} pages from index {}",
        report.board, report.pages_processed, report.newest_index
    );
    println!(
        "  {} articles in range, {} too old, {} pinned, {} removed",
        report.articles_found, report.old_skipped, report.pinned_skipped, report.removed_skipped
    );
    if report.date_parse_failures > 0 {
        println!("  {} articles kept with unreadable dates", report.date_parse_failures);
    }
    if !report.failed_pages.is_empty() {
        let pages: Vec<String> = report.failed_pages.iter().map(|p| p.to_string()).collect();
        println!("  Skipped pages: {}", pages.join(", "));
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
