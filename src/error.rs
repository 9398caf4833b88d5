use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Network error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Page not found (status {status}): {url}")]
    PageNotFound { url: String, status: u16 },

    #[error("Malformed markup at {url}: {reason}")]
    MalformedMarkup { url: String, reason: String },

    #[error("Unparseable date {raw:?}")]
    DateParse { raw: String },

    #[error("Invalid task input: {0}")]
    InvalidTaskInput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Task payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Export error: {0}")]
    Export(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CrawlError {
    pub fn malformed(url: &str, reason: impl Into<String>) -> Self {
        CrawlError::MalformedMarkup {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether a queue consumer should put the task back for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Transport { .. } | CrawlError::PageNotFound { .. } | CrawlError::Storage(_)
        )
    }
}
