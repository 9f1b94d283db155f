//! Interruption handling: on SIGINT/SIGTERM, stop the batch and persist what
//! has completed so far.

use crate::context::{Phase, RunContext};
use crate::models::Summary;
use crate::storage::StatusStore;
use anyhow::Result;
use std::future::Future;
use tracing::{error, info, warn};

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Drive `run` to completion unless `shutdown` fires first.
///
/// On shutdown the batch future is dropped (an in-flight fetch goes with it)
/// and one checkpoint is written from `ctx`, reflecting only the items whose
/// outcome was recorded. A failed checkpoint here is logged; the caller still
/// gets a summary marked `interrupted`.
pub async fn run_until_shutdown<F, S>(
    ctx: &RunContext,
    store: &StatusStore,
    shutdown: S,
    run: F,
) -> Result<Summary>
where
    F: Future<Output = Result<Summary>>,
    S: Future<Output = ()>,
{
    tokio::select! {
        res = run => res,
        () = shutdown => {
            ctx.set_phase(Phase::Checkpointing);
            warn!("Interrupted, saving progress");

            if ctx.is_primed() {
                match ctx.checkpoint(store) {
                    Ok(rows) => info!("Saved {} rows to {:?}", rows, store.table_path()),
                    Err(e) => {
                        error!("Could not save progress: {:#}", e);
                        ctx.note_checkpoint_failure();
                    }
                }
            } else {
                info!("Interrupted before any work started, table left as is");
            }

            ctx.set_phase(Phase::Terminated);
            Ok(ctx.summary(true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use crate::config::PipelineConfig;
    use crate::fetch::{FetchWorker, WorkItem};
    use crate::models::{DataType, RosterEntry, Stamp, StatusRecord};
    use crate::pipeline::Pipeline;
    use crate::storage::StatusTable;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    const DT: DataType = DataType::MonthlyRevenue;

    /// Succeeds until `stop_at`, then signals and never returns.
    struct GateWorker {
        stop_at: String,
        tx: Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl FetchWorker for GateWorker {
        async fn fetch(&self, item: &WorkItem) -> Result<()> {
            if item.code == self.stop_at {
                if let Some(tx) = self.tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                std::future::pending::<()>().await;
            }
            std::fs::write(&item.artifact, b"xls")?;
            Ok(())
        }
    }

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 8, 1).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    fn quiet() -> PipelineConfig {
        PipelineConfig {
            test_limit: None,
            item_delay_secs: 0,
            wide_item_delay_secs: 0,
            jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_interrupt_keeps_completed_items_only() {
        let dir = tempfile::tempdir().unwrap();
        let roster: Vec<_> = ["1101", "1102", "1103", "1104"]
            .iter()
            .map(|c| RosterEntry::new(*c, "x"))
            .collect();

        // Every identifier failed last week, so all four are selected in roster order.
        let store = StatusStore::new(dir.path(), DT);
        let last_week = t0() - Duration::days(7);
        let previous: StatusTable = roster
            .iter()
            .map(|e| {
                let key = DT.filename(e);
                let rec = StatusRecord {
                    filename: key.clone(),
                    last_update_time: Stamp::At(last_week - Duration::days(1)),
                    success: false,
                    process_time: Stamp::At(last_week),
                };
                (key, rec)
            })
            .collect();
        store
            .write_checkpoint(&roster, &previous, &HashMap::new(), &HashMap::new())
            .unwrap();

        let (tx, rx) = oneshot::channel();
        let worker = GateWorker {
            stop_at: "1103".into(),
            tx: Mutex::new(Some(tx)),
        };
        let pipeline = Pipeline::new(
            quiet(),
            StatusStore::new(dir.path(), DT),
            worker,
            SteppingClock::new(t0(), Duration::minutes(1)),
        );
        let ctx = RunContext::new(DT);

        let summary = run_until_shutdown(
            &ctx,
            pipeline.store(),
            async {
                rx.await.ok();
            },
            pipeline.run_batch(&roster, &ctx),
        )
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert_eq!((summary.selected, summary.succeeded, summary.failed), (4, 2, 0));
        assert_eq!(ctx.phase(), Phase::Terminated);

        let table = store.load().unwrap();
        assert_eq!(table.len(), 4);
        for (i, e) in roster[..2].iter().enumerate() {
            let rec = &table[&DT.filename(e)];
            assert!(rec.success);
            assert_eq!(rec.process_time, Stamp::At(t0() + Duration::minutes(i as i64 + 1)));
        }
        for e in &roster[2..] {
            let key = DT.filename(e);
            assert_eq!(table[&key], previous[&key]);
        }
    }

    #[tokio::test]
    async fn test_interrupt_before_start_leaves_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path(), DT);
        let ctx = RunContext::new(DT);

        let summary = run_until_shutdown(
            &ctx,
            &store,
            async {},
            std::future::pending::<Result<Summary>>(),
        )
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert!(!store.table_path().exists());
    }

    #[tokio::test]
    async fn test_completed_run_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::new(dir.path(), DT);
        let ctx = RunContext::new(DT);
        let expected = ctx.summary(false);

        let summary = run_until_shutdown(
            &ctx,
            &store,
            std::future::pending::<()>(),
            async { Ok(expected) },
        )
        .await
        .unwrap();
        assert!(!summary.interrupted);
    }
}
