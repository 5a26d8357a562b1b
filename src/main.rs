//! Continuously-running ETL worker that mirrors indexer indices into a
//! warehouse: one binary, one subcommand per entry point named in the
//! workspace's external interface.
//!
//! Architecture:
//! - `indexer` / `warehouse`: thin HTTP clients over the two external stores
//! - `config` / `state`: the workspace's two JSON files, reloaded/persisted
//!   per iteration
//! - `task` / `dashboard`: the in-process work queue and its concurrency
//!   contract
//! - `runner`: the per-task extract/transform/load pipeline
//! - `reconciler`: post-bulk source-vs-warehouse count comparison
//! - `app_controller`: ties the above into one iteration, plus rewind and
//!   mutable-reload

mod app_controller;
mod config;
mod dashboard;
mod errors;
mod file_storage;
mod indexer;
mod reconciler;
mod runner;
mod state;
mod task;
mod transformers;
mod warehouse;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use app_controller::AppController;
use config::WorkerConfig;

#[derive(Parser)]
#[command(name = "multiversxetl")]
#[command(about = "Mirrors indexer indices into a warehouse, one checkpointed bulk at a time", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Loop append-only indices: rewind once at startup, then plan/run/reconcile bulks forever
    ProcessAppendOnlyIndices {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long, default_value_t = 30)]
        sleep_seconds: u64,
    },
    /// Loop mutable indices: truncate-and-reload on a fixed cadence
    ProcessMutableIndices {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long, default_value_t = 3600)]
        sleep_seconds: u64,
    },
    /// Delete warehouse rows at or after the checkpoint, then reconcile strictly
    Rewind {
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Bisect backwards from time_partition_end to find a checkpoint that reconciles cleanly
    FindLatestGoodCheckpoint {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        search_step: i64,
    },
    /// Print the effective config/state file paths and a summary of the loaded config
    Config {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        show: bool,
        #[arg(long)]
        path: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "multiversxetl=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Shared between the two looping subcommands: run one iteration, sleep,
/// repeat, until a signal is observed between iterations. Returns `true` if
/// the loop exited because of an interrupt rather than running to natural
/// completion, so the caller can pick the right exit code.
fn run_loop(
    shutdown: &Arc<AtomicBool>,
    sleep_seconds: u64,
    mut iteration: impl FnMut() -> Result<()>,
) -> Result<bool> {
    while !shutdown.load(Ordering::SeqCst) {
        iteration()?;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_secs(sleep_seconds));
    }
    let interrupted = shutdown.load(Ordering::SeqCst);
    if interrupted {
        tracing::info!("interrupt observed between iterations, exiting");
    }
    Ok(interrupted)
}

fn install_shutdown_flag() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "failed to install signal handler, Ctrl-C will kill the process immediately");
    }
    shutdown
}

fn load_config(workspace: &PathBuf) -> Result<WorkerConfig> {
    WorkerConfig::load(&state::config_path(workspace)).context("loading worker_config.json")
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::ProcessAppendOnlyIndices {
            workspace,
            sleep_seconds,
        } => {
            let shutdown = install_shutdown_flag();
            let config = load_config(&workspace)?;
            let controller = AppController::new(workspace.clone(), &config)?;
            controller.rewind_to_checkpoint(&config)?;

            let interrupted = run_loop(&shutdown, sleep_seconds, || {
                let config = load_config(&workspace)?;
                controller.run_append_only_iteration(&config)
            })?;
            if interrupted {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::ProcessMutableIndices {
            workspace,
            sleep_seconds,
        } => {
            let shutdown = install_shutdown_flag();
            let config = load_config(&workspace)?;
            let controller = AppController::new(workspace.clone(), &config)?;

            let interrupted = run_loop(&shutdown, sleep_seconds, || {
                let config = load_config(&workspace)?;
                controller.run_mutable_iteration(&config)
            })?;
            if interrupted {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Rewind { workspace } => {
            let config = load_config(&workspace)?;
            let controller = AppController::new(workspace, &config)?;
            controller.rewind_to_checkpoint(&config)
        }
        Commands::FindLatestGoodCheckpoint {
            workspace,
            search_step,
        } => {
            let config = load_config(&workspace)?;
            let controller = AppController::new(workspace, &config)?;
            match controller.find_latest_good_checkpoint(&config, search_step)? {
                Some(candidate) => {
                    println!("{candidate}");
                    Ok(())
                }
                None => {
                    eprintln!("no consistent checkpoint found within the configured partition");
                    std::process::exit(1);
                }
            }
        }
        Commands::Config {
            workspace,
            show,
            path,
        } => {
            if path {
                println!("config: {}", state::config_path(&workspace).display());
                println!("state:  {}", state::state_path(&workspace).display());
                return Ok(());
            }
            if show {
                let config = load_config(&workspace)?;
                println!(
                    "append_only_indices: dataset={} indices={:?} threads={}",
                    config.append_only_indices.bq_dataset,
                    config.append_only_indices.indices,
                    config.append_only_indices.num_threads
                );
                println!(
                    "mutable_indices:     dataset={} indices={:?} threads={}",
                    config.mutable_indices.bq_dataset,
                    config.mutable_indices.indices,
                    config.mutable_indices.num_threads
                );
                return Ok(());
            }
            println!("Usage: multiversxetl config --workspace <path> [--show|--path]");
            Ok(())
        }
    }
}
