//! Status table: one CSV per data-type recording the last success, the last
//! outcome and the last attempt for every roster identifier.
//!
//! ## Checkpoints
//!
//! Every checkpoint is a full-table replace built from three inputs:
//!   - the table as it was loaded at the start of the run (`previous`),
//!   - the outcomes recorded so far in this run (`results`),
//!   - the attempt start times recorded so far (`attempt_times`).
//!
//! Touched identifiers always take this run's attempt time; untouched ones are
//! copied verbatim from `previous`. The file is written to a sibling `.tmp`,
//! synced, then renamed over the table so a kill at any point leaves either
//! the old or the new table on disk.

use crate::error::BatchError;
use crate::models::{parse_flag, DataType, RosterEntry, Stamp, StatusRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, SubsecRound};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TABLE_FILE: &str = "download_results.csv";
const HEADER: [&str; 4] = ["filename", "last_update_time", "success", "process_time"];

/// Persisted records keyed by filename.
pub type StatusTable = HashMap<String, StatusRecord>;

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct StatusStore {
    data_type: DataType,
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(output_root: &Path, data_type: DataType) -> Self {
        Self {
            data_type,
            dir: output_root.join(data_type.spec().folder),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn table_path(&self) -> PathBuf {
        self.dir.join(TABLE_FILE)
    }

    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Could not create dir {:?}", self.dir))
    }

    /// Load the table. A missing file is an empty table.
    pub fn load(&self) -> Result<StatusTable> {
        let path = self.table_path();
        if !path.exists() {
            debug!("{:?} does not exist yet", path);
            return Ok(StatusTable::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;

        let headers = reader.headers()?.clone();
        let col = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(name))
        };

        let Some(filename_col) = col("filename") else {
            warn!("{:?} has no filename column, treating as empty", path);
            return Ok(StatusTable::new());
        };
        let last_col = col("last_update_time");
        let success_col = col("success");
        let process_col = col("process_time");

        let mut table = StatusTable::new();
        for (i, result) in reader.records().enumerate() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!("{:?} row {}: {}", path, i + 1, e);
                    continue;
                }
            };
            let cell = |c: Option<usize>| c.and_then(|c| record.get(c)).unwrap_or("").trim();

            let filename = cell(Some(filename_col));
            if filename.is_empty() {
                continue;
            }
            // An unreadable flag reads as a failure so the row is retried,
            // but its timestamps are kept.
            let success = parse_flag(cell(success_col)).unwrap_or_else(|| {
                warn!(
                    "{:?} row {}: bad success value {:?}, reading as false",
                    path,
                    i + 1,
                    cell(success_col)
                );
                false
            });

            table.insert(
                filename.to_string(),
                StatusRecord {
                    filename: filename.to_string(),
                    last_update_time: stamp_or(cell(last_col), Stamp::Never),
                    success,
                    process_time: stamp_or(cell(process_col), Stamp::NotProcessed),
                },
            );
        }

        debug!("{:?}: {} records loaded", path, table.len());
        Ok(table)
    }

    /// Merge this run's progress into `previous` and rewrite the whole table.
    /// Returns the number of rows written.
    pub fn write_checkpoint(
        &self,
        roster: &[RosterEntry],
        previous: &StatusTable,
        results: &HashMap<String, bool>,
        attempt_times: &HashMap<String, NaiveDateTime>,
    ) -> Result<usize> {
        let rows = self.merge(roster, previous, results, attempt_times);
        self.ensure_dir()?;
        write_atomic(&self.table_path(), &rows)?;
        Ok(rows.len())
    }

    fn merge(
        &self,
        roster: &[RosterEntry],
        previous: &StatusTable,
        results: &HashMap<String, bool>,
        attempt_times: &HashMap<String, NaiveDateTime>,
    ) -> Vec<StatusRecord> {
        let mut seen = HashSet::new();
        let mut rows = Vec::with_capacity(roster.len());

        for entry in roster {
            let filename = self.data_type.filename(entry);
            if !seen.insert(filename.clone()) {
                continue;
            }
            let prior = previous.get(&filename);

            let Some(&success) = results.get(&entry.code) else {
                rows.push(
                    prior
                        .cloned()
                        .unwrap_or_else(|| StatusRecord::untouched(filename)),
                );
                continue;
            };

            let process_time = match attempt_times.get(&entry.code) {
                Some(t) => Stamp::At(*t),
                None => {
                    warn!("{}: outcome recorded without an attempt time", entry.code);
                    Stamp::NotProcessed
                }
            };

            let last_update_time = if success {
                match artifact_mtime(&self.artifact_path(&filename)) {
                    Some(t) => Stamp::At(t),
                    None => {
                        warn!(
                            "{}: reported success but {} is missing; last_update_time left NEVER",
                            entry.code, filename
                        );
                        Stamp::Never
                    }
                }
            } else {
                prior
                    .map(|r| r.last_update_time.clone())
                    .unwrap_or(Stamp::Never)
            };

            rows.push(StatusRecord {
                filename,
                last_update_time,
                success,
                process_time,
            });
        }

        rows
    }
}

fn stamp_or(cell: &str, empty: Stamp) -> Stamp {
    if cell.is_empty() { empty } else { Stamp::parse(cell) }
}

/// Artifact modification time in local time, whole seconds.
fn artifact_mtime(path: &Path) -> Option<NaiveDateTime> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Local>::from(modified).naive_local().trunc_subsecs(0))
}

/// Serialize to `<path>.tmp`, fsync, rename over `path`. The temp file is
/// removed if any step fails.
fn write_atomic(path: &Path, rows: &[StatusRecord]) -> Result<()> {
    let temp_path = path.with_extension("csv.tmp");
    let persist_err = |source: std::io::Error| BatchError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    if let Err(e) = write_temp(&temp_path, rows).and_then(|()| {
        fs::rename(&temp_path, path).map_err(|e| persist_err(e).into())
    }) {
        if temp_path.exists() {
            if let Err(rm) = fs::remove_file(&temp_path) {
                warn!("Could not remove {:?}: {}", temp_path, rm);
            }
        }
        return Err(e);
    }

    // Best effort: make the rename itself durable.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    Ok(())
}

fn write_temp(temp_path: &Path, rows: &[StatusRecord]) -> Result<()> {
    let persist_err = |source: std::io::Error| BatchError::Persistence {
        path: temp_path.to_path_buf(),
        source,
    };

    let file = fs::File::create(temp_path).map_err(persist_err)?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(HEADER)?;
    for r in rows {
        let last_update_time = r.last_update_time.to_string();
        let process_time = r.process_time.to_string();
        let success = if r.success { "true" } else { "false" };
        writer.write_record([
            r.filename.as_str(),
            last_update_time.as_str(),
            success,
            process_time.as_str(),
        ])?;
    }

    let mut file = writer
        .into_inner()
        .map_err(|e| persist_err(e.into_error()))?;
    file.flush().map_err(persist_err)?;
    file.sync_all().map_err(persist_err)?;
    Ok(())
}
