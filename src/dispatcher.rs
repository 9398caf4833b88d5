use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::queue::{CrawlTask, TaskHandle, WorkQueue};

/// Fans a walk's URL list out as one queued task per article.
pub struct Dispatcher {
    queue: Arc<dyn WorkQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self { queue }
    }

    /// Publish and return immediately. Handles come back in URL order.
    pub fn dispatch(&self, urls: &[String]) -> Result<Vec<TaskHandle>> {
        let handles = urls
            .iter()
            .map(|url| {
                self.queue.publish(&CrawlTask {
                    article_url: url.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!(tasks = handles.len(), "Dispatched article tasks");
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::CrawlError;

    #[derive(Default)]
    struct MemoryQueue {
        published: Mutex<Vec<CrawlTask>>,
        reject_after: Option<usize>,
    }

    impl WorkQueue for MemoryQueue {
        fn publish(&self, task: &CrawlTask) -> Result<TaskHandle> {
            let mut published = self.published.lock().unwrap();
            if self.reject_after == Some(published.len()) {
                return Err(CrawlError::Storage(rusqlite::Error::InvalidQuery));
            }
            published.push(task.clone());
            Ok(TaskHandle {
                id: published.len() as i64,
                article_url: task.article_url.clone(),
            })
        }
    }

    fn urls() -> Vec<String> {
        (1..=3)
            .map(|n| format!("https://www.ptt.cc/bbs/Drink/M.170000000{n}.A.001.html"))
            .collect()
    }

    #[test]
    fn one_task_per_url_in_order() {
        let queue = Arc::new(MemoryQueue::default());
        let handles = Dispatcher::new(queue.clone()).dispatch(&urls()).unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[2].id, 3);
        let published = queue.published.lock().unwrap();
        let sent: Vec<_> = published.iter().map(|t| t.article_url.clone()).collect();
        assert_eq!(sent, urls());
    }

    #[test]
    fn empty_walk_dispatches_nothing() {
        let queue = Arc::new(MemoryQueue::default());
        let handles = Dispatcher::new(queue.clone()).dispatch(&[]).unwrap();
        assert!(handles.is_empty());
    }

    #[test]
    fn publish_failure_surfaces() {
        let queue = Arc::new(MemoryQueue {
            reject_after: Some(1),
            ..Default::default()
        });
        let err = Dispatcher::new(queue).dispatch(&urls()).unwrap_err();
        assert!(matches!(err, CrawlError::Storage(_)));
    }
}
