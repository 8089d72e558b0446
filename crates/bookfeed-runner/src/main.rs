//! # bookfeed-runner
//!
//! Entry point for the order-book daemon.
//!
//! `supervise` launches one worker per enabled exchange (by default as child
//! processes of this same binary) and keeps them alive. `worker` runs a
//! single exchange's snapshot schedulers with the control channel on stdio.
//!
//! # Usage
//!
//! ```bash
//! bookfeed-runner supervise config.json --log-level info
//! bookfeed-runner worker config.json --exchange binance
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bookfeed_core::config::{AppConfig, load_config};
use bookfeed_core::control::ControlChannel;
use bookfeed_md::publish::LogPublisher;
use bookfeed_md::worker::{ReloadHook, WorkerRuntime};
use bookfeed_supervisor::{
    InProcessLauncher, ProcessLauncher, ProcessSupervisor, SupervisorEvent, WorkerLauncher,
};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

/// Order-book snapshot daemon.
#[derive(Parser)]
#[command(name = "bookfeed-runner", about = "Order-book snapshot daemon")]
struct Cli {
    #[command(subcommand)]
    command: Mode,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long, global = true)]
    log_dir: Option<String>,
}

#[derive(Subcommand)]
enum Mode {
    /// Supervise one worker per enabled exchange.
    Supervise {
        /// Configuration file path (JSON).
        config: PathBuf,

        /// Run workers as tasks inside this process instead of child processes.
        #[arg(long)]
        in_process: bool,
    },

    /// Run the worker for one exchange on stdin/stdout.
    Worker {
        /// Configuration file path (JSON).
        config: PathBuf,

        /// Exchange id from the config file.
        #[arg(long)]
        exchange: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Mode::Supervise { config, in_process } => {
            bookfeed_core::logging::init_logging(&cli.log_level, cli.log_dir.as_deref(), "bookfeed-supervisor");
            supervise(&config, in_process, &cli.log_level, cli.log_dir.as_deref()).await
        }
        Mode::Worker { config, exchange } => {
            let module = format!("bookfeed-worker-{exchange}");
            bookfeed_core::logging::init_logging(&cli.log_level, cli.log_dir.as_deref(), &module);
            worker(&config, &exchange).await
        }
    }
}

fn reload_hook(path: &Path) -> ReloadHook {
    let path = path.to_path_buf();
    Arc::new(move || load_config(&path))
}

/// Run one worker runtime to completion and map the outcome to an exit code.
async fn run_worker(config: AppConfig, path: PathBuf, exchange: String, channel: ControlChannel) -> i32 {
    let runtime = WorkerRuntime::new(exchange.clone(), config, channel, Arc::new(LogPublisher))
        .with_reload_hook(reload_hook(&path));
    match runtime.run().await {
        Ok(exit) => exit.exit_code(),
        Err(e) => {
            error!("[worker {exchange}] {e:#}");
            1
        }
    }
}

async fn worker(path: &Path, exchange: &str) -> Result<()> {
    let config = load_config(path)?;
    info!("[worker {exchange}] starting, config={}", path.display());

    let (channel, _pumps) = ControlChannel::from_stdio(exchange);
    let code = tokio::select! {
        code = run_worker(config, path.to_path_buf(), exchange.to_string(), channel) => code,
        _ = tokio::signal::ctrl_c() => {
            info!("[worker {exchange}] interrupted");
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn supervise(path: &Path, in_process: bool, log_level: &str, log_dir: Option<&str>) -> Result<()> {
    let config = load_config(path)?;
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    info!(
        "bookfeed-runner starting, config={}, {} exchange(s), mode={}",
        path.display(),
        config.enabled_exchanges().count(),
        if in_process { "in-process" } else { "process" }
    );

    let (supervisor, mut events) = ProcessSupervisor::with_sysinfo(config.supervisor.clone());

    for ex in config.enabled_exchanges() {
        let launcher: Arc<dyn WorkerLauncher> = if in_process {
            let (config, path) = (config.clone(), path.to_path_buf());
            Arc::new(
                InProcessLauncher::new(move |id, channel| run_worker(config.clone(), path.clone(), id, channel))
                    .with_pid(std::process::id()),
            )
        } else {
            let mut launcher = ProcessLauncher::new(exe.clone())
                .arg("worker")
                .arg(path.display().to_string())
                .args(["--exchange", ex.exchange.as_str(), "--log-level", log_level]);
            if let Some(dir) = log_dir {
                launcher = launcher.args(["--log-dir", dir]);
            }
            Arc::new(launcher)
        };

        match supervisor.start(&ex.exchange, launcher, ex.resource_limits()).await {
            Ok(info) => info!("[sup {}] launched, pid={:?}", ex.exchange, info.pid),
            Err(e) => error!("[sup {}] {e}", ex.exchange),
        }
    }

    info!("supervising {} worker(s), press Ctrl+C to stop", supervisor.workers().await.len());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            Some(event) = events.recv() => log_event(&event),
        }
    }

    supervisor.stop_all().await;
    info!("all workers stopped");
    Ok(())
}

fn log_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::StateChanged { exchange_id, from, to } => info!("[sup {exchange_id}] {from} -> {to}"),
        SupervisorEvent::RestartsExhausted { exchange_id, attempts } => {
            error!("[sup {exchange_id}] permanently failed after {attempts} restart(s), operator action required")
        }
        SupervisorEvent::LaunchFailed { exchange_id, error } => error!("[sup {exchange_id}] launch failed: {error}"),
        SupervisorEvent::HeartbeatTimeout { exchange_id, silent_for } => {
            warn!("[sup {exchange_id}] silent for {:.1}s", silent_for.as_secs_f64())
        }
        SupervisorEvent::Telemetry { exchange_id, kind, payload } => {
            tracing::debug!("[sup {exchange_id}] {kind}: {payload}")
        }
        other => info!("[sup {}] {other:?}", other.exchange_id()),
    }
}
