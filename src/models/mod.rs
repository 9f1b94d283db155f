use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BatchError;

// ── Data-types ────────────────────────────────────────────────────────────────

/// Static settings attached to each data-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTypeSpec {
    /// CLI selector, also passed to the fetch script.
    pub code: &'static str,
    /// Output folder and filename prefix.
    pub folder: &'static str,
    /// Appended to the filename stem before the extension.
    pub suffix: &'static str,
    pub timeout: Duration,
    /// Pages that need a larger scrape window get a longer inter-item pause.
    pub wide_window: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    DividendPolicy,
    BasicInfo,
    StockDetail,
    BusinessPerformance,
    MonthlyRevenue,
    EquityDistribution,
    WeeklyTrading,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::DividendPolicy,
        DataType::BasicInfo,
        DataType::StockDetail,
        DataType::BusinessPerformance,
        DataType::MonthlyRevenue,
        DataType::EquityDistribution,
        DataType::WeeklyTrading,
    ];

    pub const fn spec(self) -> DataTypeSpec {
        match self {
            DataType::DividendPolicy => DataTypeSpec {
                code: "1",
                folder: "DividendDetail",
                suffix: "",
                timeout: Duration::from_secs(60),
                wide_window: false,
            },
            DataType::BasicInfo => DataTypeSpec {
                code: "2",
                folder: "BasicInfo",
                suffix: "",
                timeout: Duration::from_secs(45),
                wide_window: false,
            },
            DataType::StockDetail => DataTypeSpec {
                code: "3",
                folder: "StockDetail",
                suffix: "",
                timeout: Duration::from_secs(45),
                wide_window: false,
            },
            DataType::BusinessPerformance => DataTypeSpec {
                code: "4",
                folder: "StockBzPerformance",
                suffix: "",
                timeout: Duration::from_secs(60),
                wide_window: false,
            },
            DataType::MonthlyRevenue => DataTypeSpec {
                code: "5",
                folder: "ShowSaleMonChart",
                suffix: "",
                timeout: Duration::from_secs(60),
                wide_window: false,
            },
            DataType::EquityDistribution => DataTypeSpec {
                code: "6",
                folder: "EquityDistribution",
                suffix: "",
                timeout: Duration::from_secs(90),
                wide_window: true,
            },
            DataType::WeeklyTrading => DataTypeSpec {
                code: "7",
                folder: "ShowK_ChartFlow",
                suffix: "_PER",
                timeout: Duration::from_secs(120),
                wide_window: true,
            },
        }
    }

    /// Output key for one roster entry, e.g. `BasicInfo_2330_台積電.xls`.
    pub fn filename(self, entry: &RosterEntry) -> String {
        let spec = self.spec();
        format!("{}_{}_{}{}.xls", spec.folder, entry.code, entry.name, spec.suffix)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::DividendPolicy => "DividendPolicy",
            DataType::BasicInfo => "BasicInfo",
            DataType::StockDetail => "StockDetail",
            DataType::BusinessPerformance => "BusinessPerformance",
            DataType::MonthlyRevenue => "MonthlyRevenue",
            DataType::EquityDistribution => "EquityDistribution",
            DataType::WeeklyTrading => "WeeklyTrading",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.spec().code)
    }
}

impl FromStr for DataType {
    type Err = BatchError;

    /// Accepts the numeric selector or the variant name, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        DataType::ALL
            .into_iter()
            .find(|dt| dt.spec().code == s || dt.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| BatchError::UnknownDataType(s.to_string()))
    }
}

// ── Roster ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub code: String,
    pub name: String,
}

impl RosterEntry {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self { code: code.into(), name: name.into() }
    }
}

// ── Timestamps ────────────────────────────────────────────────────────────────

pub const STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const NEVER: &str = "NEVER";
pub const NOT_PROCESSED: &str = "NOT_PROCESSED";

/// Accepted on read, tried in order. Writes always use `STAMP_FORMAT`.
const READ_FORMATS: &[&str] = &[
    STAMP_FORMAT,
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// A timestamp cell of the status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stamp {
    At(NaiveDateTime),
    Never,
    NotProcessed,
    /// Unparsable cell, written back untouched.
    Raw(String),
}

impl Stamp {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let folded = s.to_ascii_uppercase().replace(' ', "_");
        if folded == NEVER {
            return Stamp::Never;
        }
        if folded == NOT_PROCESSED {
            return Stamp::NotProcessed;
        }
        READ_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(Stamp::At)
            .unwrap_or_else(|| Stamp::Raw(s.to_string()))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stamp::At(t) => write!(f, "{}", t.format(STAMP_FORMAT)),
            Stamp::Never => f.write_str(NEVER),
            Stamp::NotProcessed => f.write_str(NOT_PROCESSED),
            Stamp::Raw(s) => f.write_str(s),
        }
    }
}

// ── Status record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub filename: String,
    /// Last success that actually (re)wrote the artifact.
    pub last_update_time: Stamp,
    /// Outcome of the most recent attempt.
    pub success: bool,
    /// Start of the most recent attempt.
    pub process_time: Stamp,
}

impl StatusRecord {
    pub fn untouched(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            last_update_time: Stamp::Never,
            success: false,
            process_time: Stamp::NotProcessed,
        }
    }
}

/// Lenient boolean used by the `success` column.
pub fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

// ── Run outcome ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    InitialScan,
    ReprocessNeeded,
    UpToDate,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::InitialScan => "initial scan",
            Strategy::ReprocessNeeded => "reprocess needed",
            Strategy::UpToDate => "up to date",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub data_type: DataType,
    pub total_roster: usize,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub strategy: Strategy,
    pub checkpoint_failures: usize,
    pub interrupted: bool,
}
