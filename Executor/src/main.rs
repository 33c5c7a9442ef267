//! Per-workflow executor process.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use broker::AlertPublisher;
use clap::{Parser, ValueEnum};
use shared_utils::config::Settings;
use store::Db;
use tracing::{info, level_filters::LevelFilter};
use workflow_executor::executor::{AlertServices, WorkflowExecutor};

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
#[command(author, version, about = "workflow_executor")]
struct Args {
    /// Workflow to load and run
    #[arg(long)]
    workflow_id: i64,
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(args.log_level))
        .init();
    info!("{args:?}");

    let settings = Settings::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let db = Arc::new(Db::open(&settings.db_path)?);
    let publisher = Arc::new(AlertPublisher::new(settings.broker.clone()));

    let services = AlertServices {
        db: Some(Arc::clone(&db)),
        publisher: Some(publisher),
        runtime: Some(runtime.handle().clone()),
    };
    let executor = WorkflowExecutor::load(db, args.workflow_id, false, settings, services)?;

    // Exit after the in-flight frame on SIGINT/SIGTERM.
    let shutdown = executor.shutdown_flag();
    runtime.spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown signal received, draining current frame");
        shutdown.store(true, Ordering::SeqCst);
    });

    executor.run()
}
