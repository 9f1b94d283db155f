//! Roster loader: the fixed population of stock codes to track.

use crate::error::BatchError;
use crate::models::RosterEntry;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Stock codes are 4 to 6 ASCII digits.
pub fn is_valid_code(s: &str) -> bool {
    (4..=6).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

/// Read the roster CSV: code in the first column, optional display name in
/// the second. Invalid codes are skipped; the first occurrence of a code wins.
pub fn load_roster(path: &Path) -> Result<Vec<RosterEntry>> {
    if !path.exists() {
        return Err(BatchError::RosterMissing(path.to_path_buf()).into());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open roster {:?}", path))?;

    let mut seen = HashSet::new();
    let mut roster = Vec::new();
    let mut skipped = 0usize;

    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Roster row {}: {}", i + 1, e);
                skipped += 1;
                continue;
            }
        };

        // Excel exports often carry a BOM or a leading quote on the code cell.
        let code = record
            .get(0)
            .unwrap_or("")
            .trim_start_matches('\u{feff}')
            .trim_start_matches('\'');

        if !is_valid_code(code) {
            debug!("Roster row {}: skipping code {:?}", i + 1, code);
            skipped += 1;
            continue;
        }

        if !seen.insert(code.to_string()) {
            debug!("Roster row {}: duplicate code {}", i + 1, code);
            continue;
        }

        let name = record.get(1).filter(|n| !n.is_empty()).unwrap_or(code);
        roster.push(RosterEntry::new(code, name));
    }

    if roster.is_empty() {
        return Err(BatchError::EmptyRoster(path.to_path_buf()).into());
    }

    info!("Roster: {} identifiers ({} rows skipped)", roster.len(), skipped);
    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_is_valid_code() {
        assert!(is_valid_code("1101"));
        assert!(is_valid_code("006208"));
        assert!(!is_valid_code("110"));
        assert!(!is_valid_code("1234567"));
        assert!(!is_valid_code("11A1"));
    }

    #[test]
    fn test_load_roster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        fs::write(
            &path,
            "代號,名稱\n1101,台泥\n1102,亞泥\nabcd,bad\n1101,dup\n2330,\n",
        )
        .unwrap();

        let roster = load_roster(&path).unwrap();
        assert_eq!(
            roster,
            vec![
                RosterEntry::new("1101", "台泥"),
                RosterEntry::new("1102", "亞泥"),
                RosterEntry::new("2330", "2330"),
            ]
        );
    }

    #[test]
    fn test_missing_roster() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_roster(&dir.path().join("nope.csv")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::RosterMissing(_))
        ));
    }

    #[test]
    fn test_empty_roster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        fs::write(&path, "code,name\nxx,none\n").unwrap();
        let err = load_roster(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::EmptyRoster(_))
        ));
    }
}
