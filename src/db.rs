use std::borrow::Cow;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use crate::error::{CrawlError, Result};
use crate::parser::article::ArticlePage;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| CrawlError::Config(format!("cannot create {}: {e}", dir.display())))?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Idempotent; call once at process startup before any worker touches the tables.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS ptt_articles (
            board          TEXT NOT NULL,
            aid            TEXT NOT NULL,
            author         TEXT NOT NULL DEFAULT '',
            title          TEXT NOT NULL DEFAULT '',
            category       TEXT NOT NULL DEFAULT '',
            content        TEXT NOT NULL DEFAULT '',
            date           TEXT NOT NULL DEFAULT '',
            ip             TEXT NOT NULL DEFAULT '',
            pushes_all     INTEGER NOT NULL DEFAULT 0,
            pushes_like    INTEGER NOT NULL DEFAULT 0,
            pushes_boo     INTEGER NOT NULL DEFAULT 0,
            pushes_neutral INTEGER NOT NULL DEFAULT 0,
            pushes_score   INTEGER NOT NULL DEFAULT 0,
            url            TEXT NOT NULL DEFAULT '',
            crawl_date     TEXT NOT NULL,
            PRIMARY KEY (board, aid)
        );

        CREATE TABLE IF NOT EXISTS crawl_tasks (
            id         INTEGER PRIMARY KEY,
            task_name  TEXT NOT NULL,
            payload    TEXT NOT NULL,
            status     TEXT NOT NULL DEFAULT 'pending'
                       CHECK(status IN ('pending','running','done','failed')),
            attempts   INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_crawl_tasks_status ON crawl_tasks(status, id);
        ",
    )?;
    Ok(())
}

// ── Articles ──

/// Character limits for the bounded text columns. `content` is unbounded.
pub const AUTHOR_LIMIT: usize = 100;
pub const TITLE_LIMIT: usize = 500;
pub const CATEGORY_LIMIT: usize = 100;
pub const DATE_LIMIT: usize = 100;
pub const IP_LIMIT: usize = 50;
pub const URL_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleRecord {
    pub board: String,
    #[serde(rename = "aid")]
    pub article_id: String,
    pub author: String,
    pub title: String,
    pub category: String,
    pub content: String,
    pub date: String,
    pub ip: String,
    pub pushes_all: u32,
    pub pushes_like: u32,
    pub pushes_boo: u32,
    pub pushes_neutral: u32,
    pub pushes_score: i32,
    pub url: String,
    pub crawl_date: NaiveDate,
}

impl ArticleRecord {
    pub fn from_page(page: &ArticlePage, crawl_date: NaiveDate) -> Self {
        let stats = &page.push_stats;
        ArticleRecord {
            board: page.board.clone(),
            article_id: page.article_id.clone(),
            author: page.author.clone(),
            title: page.title.clone(),
            category: page.category.clone(),
            content: page.content.clone(),
            date: page.timestamp_raw.clone(),
            ip: page.ip.clone(),
            pushes_all: stats.total,
            pushes_like: stats.approve,
            pushes_boo: stats.disapprove,
            pushes_neutral: stats.neutral,
            pushes_score: stats.score,
            url: page.url.clone(),
            crawl_date,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Columns whose value was cut to fit.
    pub truncated: Vec<&'static str>,
}

/// Upsert-capable article table keyed by `(board, article_id)`.
pub trait ArticleStore: Send + Sync {
    fn upsert_article(&self, record: &ArticleRecord) -> Result<UpsertOutcome>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(connect(path)?))
    }

    pub fn ensure_schema(&self) -> Result<()> {
        ensure_schema(&self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fetch_article(&self, board: &str, article_id: &str) -> Result<Option<ArticleRecord>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {ARTICLE_COLUMNS} FROM ptt_articles WHERE board = ?1 AND aid = ?2"),
                rusqlite::params![board, article_id],
                record_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Stored articles, optionally for one board, ordered by board then id.
    pub fn list_articles(&self, board: Option<&str>) -> Result<Vec<ArticleRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM ptt_articles
             WHERE ?1 IS NULL OR board = ?1
             ORDER BY board, aid"
        ))?;
        let rows = stmt
            .query_map([board], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub fn count_articles(&self) -> Result<usize> {
        let conn = self.lock();
        let n: usize = conn.query_row("SELECT COUNT(*) FROM ptt_articles", [], |r| r.get(0))?;
        Ok(n)
    }
}

impl ArticleStore for SqliteStore {
    fn upsert_article(&self, record: &ArticleRecord) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        let author = fit_column("author", &record.author, AUTHOR_LIMIT, &mut outcome);
        let title = fit_column("title", &record.title, TITLE_LIMIT, &mut outcome);
        let category = fit_column("category", &record.category, CATEGORY_LIMIT, &mut outcome);
        let date = fit_column("date", &record.date, DATE_LIMIT, &mut outcome);
        let ip = fit_column("ip", &record.ip, IP_LIMIT, &mut outcome);
        let url = fit_column("url", &record.url, URL_LIMIT, &mut outcome);

        if !outcome.truncated.is_empty() {
            warn!(
                board = %record.board,
                article_id = %record.article_id,
                columns = ?outcome.truncated,
                "Truncated over-long columns on upsert"
            );
        }

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO ptt_articles
             (board, aid, author, title, category, content, date, ip,
              pushes_all, pushes_like, pushes_boo, pushes_neutral, pushes_score, url, crawl_date)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
             ON CONFLICT(board, aid) DO UPDATE SET
                author = excluded.author,
                title = excluded.title,
                category = excluded.category,
                content = excluded.content,
                date = excluded.date,
                ip = excluded.ip,
                pushes_all = excluded.pushes_all,
                pushes_like = excluded.pushes_like,
                pushes_boo = excluded.pushes_boo,
                pushes_neutral = excluded.pushes_neutral,
                pushes_score = excluded.pushes_score,
                url = excluded.url,
                crawl_date = excluded.crawl_date",
        )?;
        stmt.execute(rusqlite::params![
            record.board,
            record.article_id,
            author,
            title,
            category,
            record.content,
            date,
            ip,
            record.pushes_all,
            record.pushes_like,
            record.pushes_boo,
            record.pushes_neutral,
            record.pushes_score,
            url,
            record.crawl_date.format(CRAWL_DATE_FORMAT).to_string(),
        ])?;
        Ok(outcome)
    }
}

const ARTICLE_COLUMNS: &str = "board, aid, author, title, category, content, date, ip,
     pushes_all, pushes_like, pushes_boo, pushes_neutral, pushes_score, url, crawl_date";
const CRAWL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Maps a row selected with `ARTICLE_COLUMNS`.
fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArticleRecord> {
    let crawl_date: String = row.get(14)?;
    let crawl_date = NaiveDate::parse_from_str(&crawl_date, CRAWL_DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ArticleRecord {
        board: row.get(0)?,
        article_id: row.get(1)?,
        author: row.get(2)?,
        title: row.get(3)?,
        category: row.get(4)?,
        content: row.get(5)?,
        date: row.get(6)?,
        ip: row.get(7)?,
        pushes_all: row.get(8)?,
        pushes_like: row.get(9)?,
        pushes_boo: row.get(10)?,
        pushes_neutral: row.get(11)?,
        pushes_score: row.get(12)?,
        url: row.get(13)?,
        crawl_date,
    })
}

/// Cut `value` to `limit` characters, recording the column when it had to be cut.
fn fit_column<'a>(
    column: &'static str,
    value: &'a str,
    limit: usize,
    outcome: &mut UpsertOutcome,
) -> Cow<'a, str> {
    match value.char_indices().nth(limit) {
        Some((byte_end, _)) => {
            outcome.truncated.push(column);
            Cow::Owned(value[..byte_end].to_string())
        }
        None => Cow::Borrowed(value),
    }
}

// ── Stats ──

pub struct Stats {
    pub articles: usize,
    pub boards: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let articles: usize = conn.query_row("SELECT COUNT(*) FROM ptt_articles", [], |r| r.get(0))?;
    let boards: usize =
        conn.query_row("SELECT COUNT(DISTINCT board) FROM ptt_articles", [], |r| r.get(0))?;
    let count_status = |status: &str| -> Result<usize> {
        let n = conn.query_row(
            "SELECT COUNT(*) FROM crawl_tasks WHERE status = ?1",
            [status],
            |r| r.get(0),
        )?;
        Ok(n)
    };
    Ok(Stats {
        articles,
        boards,
        pending: count_status("pending")?,
        running: count_status("running")?,
        done: count_status("done")?,
        failed: count_status("failed")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        SqliteStore::new(conn)
    }

    fn record(title: &str, score: i32) -> ArticleRecord {
        ArticleRecord {
            board: "Drink".into(),
            article_id: "M.1760500000.A.001".into(),
            author: "teafan (愛喝茶)".into(),
            title: title.into(),
            category: "心得".into(),
            content: "四季春加珍珠".into(),
            date: "Sun Oct  5 09:12:44 2025".into(),
            ip: "114.32.10.5".into(),
            pushes_all: 4,
            pushes_like: 2,
            pushes_boo: 1,
            pushes_neutral: 1,
            pushes_score: score,
            url: "https://www.ptt.cc/bbs/Drink/M.1760500000.A.001.html".into(),
            crawl_date: NaiveDate::from_ymd_opt(2025, 10, 18).unwrap(),
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();
    }

    #[test]
    fn upsert_twice_keeps_one_row_with_latest_values() {
        let store = store();
        store.upsert_article(&record("[心得] 初版", 1)).unwrap();
        let mut second = record("[心得] 修改版", 7);
        second.crawl_date = NaiveDate::from_ymd_opt(2025, 10, 19).unwrap();
        store.upsert_article(&second).unwrap();

        assert_eq!(store.count_articles().unwrap(), 1);
        let row = store.fetch_article("Drink", "M.1760500000.A.001").unwrap().unwrap();
        assert_eq!(row, second);
    }

    #[test]
    fn same_id_on_other_board_is_distinct() {
        let store = store();
        store.upsert_article(&record("[心得] a", 1)).unwrap();
        let mut other = record("[心得] b", 1);
        other.board = "Tea".into();
        store.upsert_article(&other).unwrap();
        assert_eq!(store.count_articles().unwrap(), 2);
    }

    #[test]
    fn over_long_columns_are_reported() {
        let store = store();
        let mut r = record("[心得] x", 0);
        r.title = "茶".repeat(TITLE_LIMIT + 10);
        r.content = "很長".repeat(10_000);
        let outcome = store.upsert_article(&r).unwrap();
        assert_eq!(outcome.truncated, vec!["title"]);

        let row = store.fetch_article("Drink", "M.1760500000.A.001").unwrap().unwrap();
        assert_eq!(row.title.chars().count(), TITLE_LIMIT);
        assert_eq!(row.content, r.content);
    }

    #[test]
    fn stats_count_tasks_and_articles() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO crawl_tasks (task_name, payload) VALUES ('crawl_article', '{}')",
            [],
        )
        .unwrap();
        let s = get_stats(&conn).unwrap();
        assert_eq!(s.articles, 0);
        assert_eq!(s.pending, 1);
        assert_eq!(s.failed, 0);
    }

    #[test]
    fn corrupt_crawl_date_is_an_error() {
        let store = store();
        store.upsert_article(&record("[心得] x", 0)).unwrap();
        store
            .lock()
            .execute("UPDATE ptt_articles SET crawl_date = 'yesterday'", [])
            .unwrap();
        let err = store.fetch_article("Drink", "M.1760500000.A.001").unwrap_err();
        assert!(matches!(
            err,
            CrawlError::Storage(rusqlite::Error::FromSqlConversionFailure(14, _, _))
        ));
    }

    #[test]
    fn list_filters_by_board() {
        let store = store();
        store.upsert_article(&record("[心得] a", 1)).unwrap();
        let mut other = record("[心得] b", 1);
        other.board = "Tea".into();
        store.upsert_article(&other).unwrap();

        assert_eq!(store.list_articles(None).unwrap().len(), 2);
        let tea = store.list_articles(Some("Tea")).unwrap();
        assert_eq!(tea.len(), 1);
        assert_eq!(tea[0].title, "[心得] b");
    }

    #[test]
    fn concurrent_writers_on_one_key_leave_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptt.sqlite");
        let first = SqliteStore::open(&path).unwrap();
        first.ensure_schema().unwrap();
        let second = SqliteStore::open(&path).unwrap();

        let writers: Vec<_> = [(first, "[心得] 甲"), (second, "[心得] 乙")]
            .into_iter()
            .map(|(store, title)| {
                std::thread::spawn(move || {
                    for score in 0..50 {
                        store.upsert_article(&record(title, score))?;
                    }
                    Ok::<_, CrawlError>(store)
                })
            })
            .collect();
        let stores: Vec<SqliteStore> = writers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();

        assert_eq!(stores[0].count_articles().unwrap(), 1);
        let row = stores[1].fetch_article("Drink", "M.1760500000.A.001").unwrap().unwrap();
        assert!(row.title == "[心得] 甲" || row.title == "[心得] 乙");
        assert_eq!(row.pushes_score, 49);
    }
}
