pub mod http_client;
pub mod script;

use crate::config::{FetchConfig, FetchMode};
use crate::models::{DataType, RosterEntry};
use crate::storage::StatusStore;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub use self::http_client::HttpWorker;
pub use self::script::ScriptWorker;

// ── Work item ─────────────────────────────────────────────────────────────────

/// One identifier selected for fetching.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub data_type: DataType,
    pub code: String,
    pub name: String,
    pub filename: String,
    /// Where a successful fetch must leave its output.
    pub artifact: PathBuf,
}

impl WorkItem {
    pub fn new(store: &StatusStore, entry: &RosterEntry) -> Self {
        let filename = store.data_type().filename(entry);
        Self {
            data_type: store.data_type(),
            code: entry.code.clone(),
            name: entry.name.clone(),
            artifact: store.artifact_path(&filename),
            filename,
        }
    }
}

// ── Worker trait ──────────────────────────────────────────────────────────────

/// Fetches one page. `Ok(())` means the artifact was (re)written.
///
/// Timeouts are applied by the caller.
#[async_trait]
pub trait FetchWorker: Send + Sync {
    async fn fetch(&self, item: &WorkItem) -> Result<()>;
}

#[async_trait]
impl<W: FetchWorker + ?Sized> FetchWorker for Box<W> {
    async fn fetch(&self, item: &WorkItem) -> Result<()> {
        (**self).fetch(item).await
    }
}

/// Build the worker selected by `fetch.mode`. Fails before any work begins if
/// the worker cannot run at all.
pub fn build_worker(config: &FetchConfig) -> Result<Box<dyn FetchWorker>> {
    Ok(match config.mode {
        FetchMode::Script => Box::new(ScriptWorker::new(config)?),
        FetchMode::Http => Box::new(HttpWorker::new(config)?),
    })
}
