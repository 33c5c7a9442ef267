//! Control-plane process: reconciles the persisted video source set with
//! running decoder workers on a fixed tick.

mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use shared_utils::config::Settings;
use store::Db;
use tracing::{info, level_filters::LevelFilter};

use supervisor::Orchestrator;

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "orchestrator")]
struct Args {
    /// Seconds between reconciliation ticks
    #[arg(long, default_value_t = 5)]
    tick_seconds: u64,
    /// Decoder worker executable to spawn per source
    #[arg(long, default_value = "decoder_worker")]
    worker_bin: PathBuf,
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(args.log_level))
        .init();
    info!("{args:?}");

    let settings = Settings::from_env();
    let db = Arc::new(Db::open(&settings.db_path)?);
    let mut orchestrator =
        Orchestrator::new(db, args.worker_bin, settings.ringbuffer_duration)?;

    info!("orchestrator started, managing sources every {}s", args.tick_seconds);
    let mut interval = tokio::time::interval(Duration::from_secs(args.tick_seconds.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = orchestrator.tick().await {
                    tracing::error!("reconciliation tick failed: {e:#}");
                }
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }

    orchestrator.stop_all().await?;
    info!("all sources stopped, exiting");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}
