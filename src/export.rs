use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::db::SqliteStore;
use crate::error::Result;

#[derive(Debug)]
pub struct ExportSummary {
    pub rows: usize,
    pub path: PathBuf,
    pub latest_path: PathBuf,
}

/// Write stored articles to `ptt_<board>_<timestamp>.csv` in `dir` and refresh
/// `ptt_<board>_latest.csv` next to it. Without a board every row is exported under `all`.
pub fn export_articles(store: &SqliteStore, board: Option<&str>, dir: &Path) -> Result<ExportSummary> {
    let rows = store.list_articles(board)?;
    fs::create_dir_all(dir)?;

    let label = board.unwrap_or("all");
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("ptt_{}_{}.csv", label, ts));
    let latest_path = dir.join(format!("ptt_{}_latest.csv", label));

    let mut wtr = csv::Writer::from_path(&path)?;
    for row in &rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    fs::copy(&path, &latest_path)?;

    info!(rows = rows.len(), path = %path.display(), "Exported articles");
    Ok(ExportSummary {
        rows: rows.len(),
        path,
        latest_path,
    })
}
