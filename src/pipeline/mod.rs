//! Run coordinator: classify → fetch each selected identifier → checkpoint.
//!
//! ## Run flow
//!
//!   1. Load the status table once and classify the roster against it.
//!   2. Nothing selected and everything fresh: write one checkpoint, return.
//!   3. Otherwise checkpoint the untouched table, then for each work item
//!      record the attempt time, run the worker under its timeout, record the
//!      outcome and checkpoint again. Progress after item i survives a kill
//!      before item i+1.
//!
//! A failed fetch is recorded and the loop moves on. Only a missing output
//! directory or an unreadable table stops the run.

use crate::classifier::classify;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::fetch::{FetchWorker, WorkItem};
use crate::models::{RosterEntry, Strategy, Summary};
use crate::storage::StatusStore;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};

/// Attempts per checkpoint after the first failure.
const CHECKPOINT_RETRIES: usize = 3;

pub struct Pipeline<W, C> {
    config: PipelineConfig,
    store: StatusStore,
    worker: W,
    clock: C,
}

impl<W: FetchWorker, C: Clock> Pipeline<W, C> {
    pub fn new(config: PipelineConfig, store: StatusStore, worker: W, clock: C) -> Self {
        Self { config, store, worker, clock }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub async fn run_batch(&self, roster: &[RosterEntry], ctx: &RunContext) -> Result<Summary> {
        let data_type = self.store.data_type();
        let spec = data_type.spec();

        self.store.ensure_dir()?;
        let previous = self
            .store
            .load()
            .with_context(|| format!("Failed to load status table for {}", data_type))?;

        // ── 1. Classify ─────────────────────────────────────────────────────
        let c = classify(self.clock.now(), data_type, roster, &previous);
        info!(
            "{}: {} fresh | {} expired | {} failed | {} never attempted → {} ({})",
            data_type,
            c.fresh.len(),
            c.expired.len(),
            c.failed.len(),
            c.never_attempted.len(),
            c.work_list.len(),
            c.strategy,
        );

        if c.work_list.is_empty() && c.strategy == Strategy::UpToDate {
            info!("Everything is up to date, refreshing table only");
            ctx.begin(roster, previous, c.strategy, 0);
            self.checkpoint(ctx).await;
            return Ok(ctx.summary(false));
        }

        let mut work = c.work_list;
        if let Some(limit) = self.config.test_limit {
            if work.len() > limit {
                info!("Test limit: processing {} of {} selected", limit, work.len());
                work.truncate(limit);
            }
        }

        ctx.begin(roster, previous, c.strategy, work.len());
        self.checkpoint(ctx).await;

        // ── 2. Fetch ────────────────────────────────────────────────────────
        let total = work.len();
        for (i, entry) in work.iter().enumerate() {
            let item = WorkItem::new(&self.store, entry);

            ctx.record_attempt(&entry.code, self.clock.now());
            let ok = match timeout(spec.timeout, self.worker.fetch(&item)).await {
                Ok(Ok(())) => {
                    info!("[{}/{}] {} {}: ok", i + 1, total, entry.code, entry.name);
                    true
                }
                Ok(Err(e)) => {
                    warn!("[{}/{}] {} {}: {:#}", i + 1, total, entry.code, entry.name, e);
                    false
                }
                Err(_) => {
                    warn!(
                        "[{}/{}] {} {}: timed out after {:?}",
                        i + 1, total, entry.code, entry.name, spec.timeout
                    );
                    false
                }
            };
            ctx.record_result(&entry.code, ok);
            self.checkpoint(ctx).await;

            if i + 1 < total {
                let pause = self.item_delay(spec.wide_window);
                if !pause.is_zero() {
                    debug!("Sleeping {:?}", pause);
                    sleep(pause).await;
                }
            }
        }

        // ── 3. Final checkpoint ─────────────────────────────────────────────
        self.checkpoint(ctx).await;
        Ok(ctx.summary(false))
    }

    /// Write the table with a short retry. A checkpoint that keeps failing is
    /// counted and the run carries on in memory.
    async fn checkpoint(&self, ctx: &RunContext) {
        let backoff = ExponentialBackoff::from_millis(10)
            .map(jitter)
            .take(CHECKPOINT_RETRIES);
        let store = &self.store;

        match Retry::spawn(backoff, move || async move { ctx.checkpoint(store) }).await {
            Ok(rows) => debug!("Checkpoint: {} rows → {:?}", rows, store.table_path()),
            Err(e) => {
                error!("Checkpoint failed, progress is NOT being saved: {:#}", e);
                ctx.note_checkpoint_failure();
            }
        }
    }

    fn item_delay(&self, wide_window: bool) -> Duration {
        let secs = if wide_window {
            self.config.wide_item_delay_secs
        } else {
            self.config.item_delay_secs
        };
        let jitter_ms = match self.config.jitter_ms {
            0 => 0,
            max => rand::random_range(0..=max),
        };
        Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use crate::models::{DataType, Stamp, StatusRecord};
    use crate::storage::StatusTable;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
    use std::collections::HashSet;
    use std::fs;
    use std::sync::Mutex;

    const DT: DataType = DataType::StockDetail;

    /// Succeeds by writing the artifact unless the code is listed as failing.
    struct FakeWorker {
        failing: HashSet<String>,
        hang: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeWorker {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                hang: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FetchWorker for FakeWorker {
        async fn fetch(&self, item: &WorkItem) -> Result<()> {
            self.calls.lock().unwrap().push(item.code.clone());
            if self.hang.contains(&item.code) {
                std::future::pending::<()>().await;
            }
            if self.failing.contains(&item.code) {
                return Err(anyhow!("page not found"));
            }
            fs::write(&item.artifact, b"xls")?;
            Ok(())
        }
    }

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn quiet() -> PipelineConfig {
        PipelineConfig {
            test_limit: None,
            item_delay_secs: 0,
            wide_item_delay_secs: 0,
            jitter_ms: 0,
        }
    }

    fn roster(codes: &[&str]) -> Vec<RosterEntry> {
        codes.iter().map(|c| RosterEntry::new(*c, format!("co{c}"))).collect()
    }

    fn pipeline(
        dir: &std::path::Path,
        worker: FakeWorker,
        config: PipelineConfig,
    ) -> Pipeline<FakeWorker, SteppingClock> {
        Pipeline::new(
            config,
            StatusStore::new(dir, DT),
            worker,
            SteppingClock::new(t0(), ChronoDuration::minutes(1)),
        )
    }

    fn key(code: &str) -> String {
        DT.filename(&RosterEntry::new(code, format!("co{code}")))
    }

    #[tokio::test]
    async fn test_initial_scan_processes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), FakeWorker::new(&["1103"]), quiet());
        let ctx = RunContext::new(DT);

        let summary = p.run_batch(&roster(&["1101", "1102", "1103"]), &ctx).await.unwrap();
        assert_eq!(summary.strategy, Strategy::InitialScan);
        assert_eq!((summary.selected, summary.succeeded, summary.failed), (3, 2, 1));
        assert_eq!(p.worker.calls(), ["1101", "1102", "1103"]);

        let table = p.store().load().unwrap();
        assert_eq!(table.len(), 3);
        assert!(table[&key("1101")].success);
        assert!(matches!(table[&key("1101")].last_update_time, Stamp::At(_)));

        // Clock call 0 classifies; attempts start at +1, +2, +3 minutes.
        let failed = &table[&key("1103")];
        assert!(!failed.success);
        assert_eq!(failed.last_update_time, Stamp::Never);
        assert_eq!(failed.process_time, Stamp::At(t0() + ChronoDuration::minutes(3)));
    }

    #[tokio::test]
    async fn test_up_to_date_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), FakeWorker::new(&[]), quiet());
        let ctx = RunContext::new(DT);
        let r = roster(&["1101"]);
        p.run_batch(&r, &ctx).await.unwrap();

        let second = pipeline(dir.path(), FakeWorker::new(&[]), quiet());
        let before = fs::read(second.store().table_path()).unwrap();
        let summary = second.run_batch(&r, &RunContext::new(DT)).await.unwrap();
        assert_eq!(summary.strategy, Strategy::UpToDate);
        assert_eq!(summary.selected, 0);
        assert!(second.worker.calls().is_empty());
        assert_eq!(before, fs::read(second.store().table_path()).unwrap());
    }

    #[tokio::test]
    async fn test_reprocessed_item_takes_new_process_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path(), DT);
        let stale = t0() - ChronoDuration::days(10);
        let mut previous = StatusTable::new();
        for code in ["1101", "1102"] {
            previous.insert(
                key(code),
                StatusRecord {
                    filename: key(code),
                    last_update_time: Stamp::At(stale),
                    success: code == "1101",
                    process_time: Stamp::At(stale),
                },
            );
        }
        store
            .write_checkpoint(&roster(&["1101", "1102"]), &previous, &Default::default(), &Default::default())
            .unwrap();

        let p = pipeline(dir.path(), FakeWorker::new(&["1102"]), quiet());
        let summary = p.run_batch(&roster(&["1101", "1102"]), &RunContext::new(DT)).await.unwrap();
        assert_eq!(summary.strategy, Strategy::ReprocessNeeded);
        // Failed before expired.
        assert_eq!(p.worker.calls(), ["1102", "1101"]);

        let table = p.store().load().unwrap();
        let failed = &table[&key("1102")];
        assert_eq!(failed.process_time, Stamp::At(t0() + ChronoDuration::minutes(1)));
        assert_eq!(failed.last_update_time, Stamp::At(stale));
        assert!(!failed.success);
        let expired = &table[&key("1101")];
        assert_eq!(expired.process_time, Stamp::At(t0() + ChronoDuration::minutes(2)));
        assert!(expired.success);
    }

    #[tokio::test]
    async fn test_test_limit_leaves_rest_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig { test_limit: Some(1), ..quiet() };
        let p = pipeline(dir.path(), FakeWorker::new(&[]), config);
        let summary = p.run_batch(&roster(&["1101", "1102"]), &RunContext::new(DT)).await.unwrap();
        assert_eq!(summary.selected, 1);
        assert_eq!(summary.total_roster, 2);

        let table = p.store().load().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&key("1102")], StatusRecord::untouched(key("1102")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = FakeWorker::new(&[]);
        worker.hang.insert("1101".into());
        let p = pipeline(dir.path(), worker, quiet());

        let summary = p.run_batch(&roster(&["1101", "1102"]), &RunContext::new(DT)).await.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert!(!p.store().load().unwrap()[&key("1101")].success);
    }

    #[test]
    fn test_checkpoint_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the data-type folder should be.
        fs::write(dir.path().join(DT.spec().folder), b"").unwrap();
        let p = pipeline(dir.path(), FakeWorker::new(&[]), quiet());
        let ctx = RunContext::new(DT);
        ctx.begin(&roster(&["1101"]), StatusTable::new(), Strategy::InitialScan, 1);

        tokio_test::block_on(p.checkpoint(&ctx));
        assert_eq!(ctx.summary(false).checkpoint_failures, 1);
    }

    #[test]
    fn test_item_delay() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            test_limit: None,
            item_delay_secs: 2,
            wide_item_delay_secs: 7,
            jitter_ms: 0,
        };
        let p = pipeline(dir.path(), FakeWorker::new(&[]), config);
        assert_eq!(p.item_delay(false), Duration::from_secs(2));
        assert_eq!(p.item_delay(true), Duration::from_secs(7));
    }

    #[test]
    fn test_item_delay_jitter_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            test_limit: None,
            item_delay_secs: 1,
            wide_item_delay_secs: 1,
            jitter_ms: 250,
        };
        let p = pipeline(dir.path(), FakeWorker::new(&[]), config.clone());
        for _ in 0..50 {
            let d = p.item_delay(false);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_millis(1250));
        }

        let p = pipeline(
            dir.path(),
            FakeWorker::new(&[]),
            PipelineConfig { jitter_ms: u64::MAX, ..config },
        );
        assert!(p.item_delay(true) >= Duration::from_secs(1));
    }
}
