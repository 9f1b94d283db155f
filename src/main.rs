mod classifier;
mod clock;
mod config;
mod context;
mod error;
mod fetch;
mod interrupt;
mod loader;
mod models;
mod pipeline;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::classifier::classify;
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, FetchMode};
use crate::context::RunContext;
use crate::error::BatchError;
use crate::fetch::build_worker;
use crate::interrupt::{run_until_shutdown, shutdown_signal};
use crate::loader::load_roster;
use crate::models::{DataType, Summary};
use crate::pipeline::Pipeline;
use crate::storage::StatusStore;
use crate::utils::fmt_number;

#[derive(Parser)]
#[command(name = "stock-batch", about = "Periodic per-stock page fetcher with crash-safe status tracking", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every stale, failed or never-attempted identifier for a data-type
    Run {
        /// Data-type selector (number or name, see `types`)
        data_type: String,

        /// Process only the first N selected identifiers
        #[arg(short, long)]
        limit: Option<usize>,

        /// Fetch backend (overrides fetch.mode)
        #[arg(short, long, value_enum)]
        mode: Option<FetchMode>,

        /// Also print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how the roster classifies right now, without fetching
    Status {
        data_type: String,
    },

    /// List the known data-types
    Types,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "stock_batch=info,warn",
        1 => "stock_batch=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let config_error = e
                .downcast_ref::<BatchError>()
                .is_some_and(BatchError::is_config);
            ExitCode::from(if config_error { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Run { data_type, limit, mode, json } => {
            let data_type: DataType = data_type.parse()?;
            if let Some(mode) = mode {
                config.fetch.mode = mode;
            }
            if limit.is_some() {
                config.pipeline.test_limit = limit;
            }

            let _t = utils::Timer::start(format!("{} batch", data_type));
            let roster = load_roster(&config.paths.roster)?;
            let worker = build_worker(&config.fetch)?;
            let store = StatusStore::new(&config.paths.output_root, data_type);

            let ctx = RunContext::new(data_type);
            let pipeline = Pipeline::new(config.pipeline.clone(), store, worker, SystemClock);
            let outcome = run_until_shutdown(
                &ctx,
                pipeline.store(),
                shutdown_signal(),
                pipeline.run_batch(&roster, &ctx),
            )
            .await;
            debug!("Run context finished in phase {:?}", ctx.phase());

            print_summary(&summary_of(&ctx, &outcome));
            let summary = outcome?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }

        Command::Status { data_type } => {
            let data_type: DataType = data_type.parse()?;
            let roster = load_roster(&config.paths.roster)?;
            let store = StatusStore::new(&config.paths.output_root, data_type);
            let table = store.load()?;
            let c = classify(SystemClock.now(), data_type, &roster, &table);

            println!("─────────────────────────────────");
            println!("  {}", data_type);
            println!("─────────────────────────────────");
            println!("  Roster          : {}", fmt_number(roster.len()));
            println!("  Fresh           : {}", fmt_number(c.fresh.len()));
            println!("  Expired         : {}", fmt_number(c.expired.len()));
            println!("  Failed          : {}", fmt_number(c.failed.len()));
            println!("  Never attempted : {}", fmt_number(c.never_attempted.len()));
            println!("  Next run        : {} ({})", fmt_number(c.work_list.len()), c.strategy);
            println!("─────────────────────────────────");
        }

        Command::Types => {
            for dt in DataType::ALL {
                let spec = dt.spec();
                println!(
                    "  {}  {:<20} {:<20} timeout {:>3}s{}",
                    spec.code,
                    dt.name(),
                    spec.folder,
                    spec.timeout.as_secs(),
                    if spec.wide_window { "  (wide window)" } else { "" },
                );
            }
        }
    }

    Ok(())
}

/// The summary is printed even when the batch stopped on an error.
fn summary_of(ctx: &RunContext, outcome: &Result<Summary>) -> Summary {
    match outcome {
        Ok(summary) => summary.clone(),
        Err(_) => ctx.summary(false),
    }
}

fn print_summary(s: &Summary) {
    if s.interrupted {
        info!("Run interrupted; progress up to the last completed item was saved");
    }
    println!("─────────────────────────────────");
    println!("  {} — run summary", s.data_type);
    println!("─────────────────────────────────");
    println!("  Roster    : {}", fmt_number(s.total_roster));
    println!("  Selected  : {}", fmt_number(s.selected));
    println!("  Succeeded : {}", fmt_number(s.succeeded));
    println!("  Failed    : {}", fmt_number(s.failed));
    println!("  Strategy  : {}", s.strategy);
    if s.interrupted {
        println!("  Status    : interrupted");
    }
    if s.checkpoint_failures > 0 {
        println!("  WARNING   : {} checkpoint writes failed", s.checkpoint_failures);
    }
    println!("─────────────────────────────────");
}
