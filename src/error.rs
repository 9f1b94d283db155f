//! Error taxonomy for a batch run.
//!
//! Configuration errors abort before any work begins. Persistence errors are
//! surfaced by the checkpoint path but do not stop a run. Per-item fetch
//! failures never reach this type; they are recorded as `success=false`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("unknown data type '{0}' (run `stock-batch types` for the list)")]
    UnknownDataType(String),

    #[error("roster file not found: {0:?}")]
    RosterMissing(PathBuf),

    #[error("roster {0:?} contains no valid identifiers")]
    EmptyRoster(PathBuf),

    #[error("fetch worker entry point not found: {0:?}")]
    WorkerMissing(PathBuf),

    #[error("invalid url template '{template}': {reason}")]
    InvalidUrlTemplate { template: String, reason: String },

    #[error("could not persist status table {path:?}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BatchError {
    /// True for errors that must stop the process before a run starts.
    pub fn is_config(&self) -> bool {
        !matches!(self, BatchError::Persistence { .. })
    }
}
