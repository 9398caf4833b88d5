use std::sync::Mutex;

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

pub const CRAWL_ARTICLE_TASK: &str = "crawl_article";

/// One article to fetch, parse and store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    pub article_url: String,
}

/// Receipt for a published task. Says nothing about whether it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub id: i64,
    pub article_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: i64,
    pub attempts: u32,
    pub task: CrawlTask,
}

/// Where the dispatcher sends work.
pub trait WorkQueue: Send + Sync {
    fn publish(&self, task: &CrawlTask) -> Result<TaskHandle>;
}

/// Where workers take work from.
pub trait TaskSource: Send + Sync {
    /// Move up to `limit` pending tasks to `running` and return them, oldest first.
    fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedTask>>;
    fn ack(&self, id: i64) -> Result<()>;
    /// Put a task back as pending, or mark it failed once it has used `max_attempts`.
    /// Returns true when the task was requeued.
    fn retry(&self, id: i64, error: &str, max_attempts: u32) -> Result<bool>;
    fn fail(&self, id: i64, error: &str) -> Result<()>;
}

pub struct SqliteQueue {
    conn: Mutex<Connection>,
}

impl SqliteQueue {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tasks left `running` by a worker that died are made claimable again.
    pub fn recover_stale(&self) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE crawl_tasks SET status = 'pending', updated_at = datetime('now')
             WHERE status = 'running'",
            [],
        )?;
        if n > 0 {
            warn!(tasks = n, "Requeued tasks left running by a previous worker");
        }
        Ok(n)
    }

    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.lock();
        let n: usize = conn.query_row(
            "SELECT COUNT(*) FROM crawl_tasks WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    #[cfg(test)]
    pub fn status_of(&self, id: i64) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let conn = self.lock();
        let status = conn
            .query_row("SELECT status FROM crawl_tasks WHERE id = ?1", [id], |r| r.get(0))
            .optional()?;
        Ok(status)
    }
}

impl WorkQueue for SqliteQueue {
    fn publish(&self, task: &CrawlTask) -> Result<TaskHandle> {
        let payload = serde_json::to_string(task)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO crawl_tasks (task_name, payload) VALUES (?1, ?2)",
            rusqlite::params![CRAWL_ARTICLE_TASK, payload],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, url = %task.article_url, "Published task");
        Ok(TaskHandle {
            id,
            article_url: task.article_url.clone(),
        })
    }
}

impl TaskSource for SqliteQueue {
    fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedTask>> {
        let mut conn = self.lock();
        // Take the write lock up front so concurrent claimers wait on busy_timeout
        // instead of failing a read-to-write upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows: Vec<(i64, u32, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attempts, payload FROM crawl_tasks
                 WHERE status = 'pending' AND task_name = ?1
                 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![CRAWL_ARTICLE_TASK, limit as i64], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for (id, attempts, payload) in rows {
            match serde_json::from_str::<CrawlTask>(&payload) {
                Ok(task) => {
                    let updated = tx.execute(
                        "UPDATE crawl_tasks SET status = 'running', attempts = attempts + 1,
                         updated_at = datetime('now') WHERE id = ?1 AND status = 'pending'",
                        [id],
                    )?;
                    if updated == 1 {
                        claimed.push(ClaimedTask {
                            id,
                            attempts: attempts + 1,
                            task,
                        });
                    }
                }
                Err(e) => {
                    warn!(id, error = %e, "Unreadable task payload, marking failed");
                    tx.execute(
                        "UPDATE crawl_tasks SET status = 'failed', last_error = ?2,
                         updated_at = datetime('now') WHERE id = ?1 AND status = 'pending'",
                        rusqlite::params![id, e.to_string()],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn ack(&self, id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE crawl_tasks SET status = 'done', last_error = NULL,
             updated_at = datetime('now') WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    fn retry(&self, id: i64, error: &str, max_attempts: u32) -> Result<bool> {
        let conn = self.lock();
        let attempts: u32 =
            conn.query_row("SELECT attempts FROM crawl_tasks WHERE id = ?1", [id], |r| r.get(0))?;
        let status = if attempts >= max_attempts { "failed" } else { "pending" };
        conn.execute(
            "UPDATE crawl_tasks SET status = ?2, last_error = ?3,
             updated_at = datetime('now') WHERE id = ?1",
            rusqlite::params![id, status, error],
        )?;
        Ok(status == "pending")
    }

    fn fail(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE crawl_tasks SET status = 'failed', last_error = ?2,
             updated_at = datetime('now') WHERE id = ?1",
            rusqlite::params![id, error],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect, ensure_schema};

    fn queue() -> SqliteQueue {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        SqliteQueue::new(conn)
    }

    fn task(n: u32) -> CrawlTask {
        CrawlTask {
            article_url: format!("https://www.ptt.cc/bbs/Drink/M.17000000{n:02}.A.001.html"),
        }
    }

    #[test]
    fn publish_returns_increasing_handles() {
        let q = queue();
        let a = q.publish(&task(1)).unwrap();
        let b = q.publish(&task(2)).unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.article_url, task(1).article_url);
        assert_eq!(q.pending_count().unwrap(), 2);
    }

    #[test]
    fn payload_shape() {
        let json = serde_json::to_string(&task(1)).unwrap();
        assert_eq!(
            json,
            r#"{"article_url":"https://www.ptt.cc/bbs/Drink/M.1700000001.A.001.html"}"#
        );
    }

    #[test]
    fn claim_marks_running_in_order() {
        let q = queue();
        for n in 1..=3 {
            q.publish(&task(n)).unwrap();
        }
        let batch = q.claim_batch(2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].task, task(1));
        assert_eq!(batch[0].attempts, 1);
        assert_eq!(q.status_of(batch[0].id).unwrap().as_deref(), Some("running"));
        assert_eq!(q.claim_batch(10).unwrap().len(), 1);
        assert!(q.claim_batch(10).unwrap().is_empty());
    }

    #[test]
    fn ack_marks_done() {
        let q = queue();
        let h = q.publish(&task(1)).unwrap();
        q.claim_batch(1).unwrap();
        q.ack(h.id).unwrap();
        assert_eq!(q.status_of(h.id).unwrap().as_deref(), Some("done"));
    }

    #[test]
    fn retry_requeues_until_attempts_exhausted() {
        let q = queue();
        let h = q.publish(&task(1)).unwrap();

        q.claim_batch(1).unwrap();
        assert!(q.retry(h.id, "503", 2).unwrap());
        assert_eq!(q.status_of(h.id).unwrap().as_deref(), Some("pending"));

        let again = q.claim_batch(1).unwrap();
        assert_eq!(again[0].attempts, 2);
        assert!(!q.retry(h.id, "503", 2).unwrap());
        assert_eq!(q.status_of(h.id).unwrap().as_deref(), Some("failed"));
    }

    #[test]
    fn bad_payload_is_failed_not_claimed() {
        let q = queue();
        {
            let conn = q.lock();
            conn.execute(
                "INSERT INTO crawl_tasks (task_name, payload) VALUES ('crawl_article', 'not json')",
                [],
            )
            .unwrap();
        }
        assert!(q.claim_batch(5).unwrap().is_empty());
        assert_eq!(q.status_of(1).unwrap().as_deref(), Some("failed"));
    }

    #[test]
    fn concurrent_claimers_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.sqlite");
        let publisher = SqliteQueue::new(connect(&path).unwrap());
        {
            let conn = publisher.lock();
            ensure_schema(&conn).unwrap();
        }
        for n in 0..400 {
            publisher
                .publish(&CrawlTask {
                    article_url: format!("https://www.ptt.cc/bbs/Drink/M.{n}.A.001.html"),
                })
                .unwrap();
        }

        let consumers: Vec<SqliteQueue> =
            (0..4).map(|_| SqliteQueue::new(connect(&path).unwrap())).collect();
        let handles: Vec<_> = consumers
            .into_iter()
            .map(|q| {
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    loop {
                        let batch = q.claim_batch(1)?;
                        if batch.is_empty() {
                            return Ok::<_, crate::error::CrawlError>(ids);
                        }
                        ids.extend(batch.iter().map(|c| c.id));
                    }
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap().unwrap());
        }
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(total, 400);
        assert_eq!(all.len(), 400);
        assert_eq!(publisher.pending_count().unwrap(), 0);
    }

    #[test]
    fn stale_running_tasks_recovered() {
        let q = queue();
        q.publish(&task(1)).unwrap();
        q.claim_batch(1).unwrap();
        assert_eq!(q.recover_stale().unwrap(), 1);
        assert_eq!(q.pending_count().unwrap(), 1);
    }
}
