//! Freshness policy: which identifiers need (re)fetching on this run.

use crate::models::{DataType, RosterEntry, Stamp, Strategy};
use crate::storage::StatusTable;
use chrono::{Duration, NaiveDateTime};

/// A success younger than this is not fetched again.
pub const FRESHNESS_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Fresh,
    Expired,
    Failed,
    NeverAttempted,
}

/// The roster split into four disjoint buckets, roster order kept within each.
#[derive(Debug, Clone)]
pub struct Classification {
    pub fresh: Vec<RosterEntry>,
    pub expired: Vec<RosterEntry>,
    pub failed: Vec<RosterEntry>,
    pub never_attempted: Vec<RosterEntry>,
    /// `failed`, then `never_attempted`, then `expired`.
    pub work_list: Vec<RosterEntry>,
    pub strategy: Strategy,
}

/// Bucket for one identifier. A failed outcome wins over an unreadable
/// attempt time; a success without a parseable one counts as never attempted.
pub fn bucket_for(now: NaiveDateTime, key: &str, table: &StatusTable) -> Bucket {
    let Some(record) = table.get(key) else {
        return Bucket::NeverAttempted;
    };
    if record.process_time == Stamp::NotProcessed {
        return Bucket::NeverAttempted;
    }
    if !record.success {
        return Bucket::Failed;
    }
    let Stamp::At(process_time) = record.process_time else {
        return Bucket::NeverAttempted;
    };
    if now - process_time <= FRESHNESS_WINDOW {
        Bucket::Fresh
    } else {
        Bucket::Expired
    }
}

pub fn classify(
    now: NaiveDateTime,
    data_type: DataType,
    roster: &[RosterEntry],
    table: &StatusTable,
) -> Classification {
    let mut fresh = Vec::new();
    let mut expired = Vec::new();
    let mut failed = Vec::new();
    let mut never_attempted = Vec::new();

    for entry in roster {
        let key = data_type.filename(entry);
        let bucket = match bucket_for(now, &key, table) {
            Bucket::Fresh => &mut fresh,
            Bucket::Expired => &mut expired,
            Bucket::Failed => &mut failed,
            Bucket::NeverAttempted => &mut never_attempted,
        };
        bucket.push(entry.clone());
    }

    let work_list: Vec<RosterEntry> = failed
        .iter()
        .chain(&never_attempted)
        .chain(&expired)
        .cloned()
        .collect();

    let strategy = if table.is_empty() {
        Strategy::InitialScan
    } else if !work_list.is_empty() {
        Strategy::ReprocessNeeded
    } else {
        Strategy::UpToDate
    };

    Classification {
        fresh,
        expired,
        failed,
        never_attempted,
        work_list,
        strategy,
    }
}
