//! Daemon entry point: configuration, logging, service wiring, signal
//! handling, and the host-action epilogue.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use rqd::config::Config;
use rqd::error::ConfigError;
use rqd::lock::HostAction;
use rqd::machine::HostFacts;
use rqd::reaper::ChildWatcher;
use rqd::rqcore::RqdCore;
use rqd::sampler::ProcSampler;
use rqd::server;

/// How long a signal-driven shutdown waits for frames before killing them,
/// and then how long it waits for the kills to land.
const DRAIN_PATIENCE: Duration = Duration::from_secs(5);
const KILL_PATIENCE: Duration = Duration::from_secs(5);

#[derive(Debug, StructOpt)]
#[structopt(name = "rqd", about = "Render-farm host agent")]
struct Opt {
    /// Path to the YAML configuration file.
    #[structopt(short = "c", long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Override the configured listen host.
    #[structopt(long)]
    host: Option<String>,

    /// Override the configured listen port.
    #[structopt(long)]
    port: Option<u16>,

    /// Log to stderr instead of the daemon logfile.
    #[structopt(long)]
    foreground: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::from_args();
    match run(opt).await {
        Ok(Some(HostAction::Restart)) => {
            info!("re-executing for restart");
            restart_self();
        }
        Ok(Some(HostAction::Reboot)) => {
            info!("invoking system reboot");
            reboot_host();
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("rqd: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(opt: Opt) -> Result<Option<HostAction>, ConfigError> {
    let mut config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = opt.host {
        config.grpc.host = host;
    }
    if let Some(port) = opt.port {
        config.grpc.port = port;
    }

    let _log_guard = init_logging(&config, opt.foreground);

    let addr_text = format!("{}:{}", config.grpc.host, config.grpc.port);
    let addr: SocketAddr = addr_text
        .parse()
        .map_err(|e| ConfigError::ListenAddr {
            addr: addr_text.clone(),
            reason: format!("{}", e),
        })?;

    let facts = Arc::new(HostFacts::detect(&config.machine.linux));
    info!(
        hostname = %facts.hostname,
        total_cores = facts.total_cores,
        is_desktop = facts.is_desktop,
        boot_time = facts.boot_time,
        "starting rqd"
    );

    let watcher = ChildWatcher::spawn()
        .map_err(|e| ConfigError::Startup(format!("could not install child watcher: {}", e)))?;

    let sampler_interval = Duration::from_secs(config.sampler.interval_seconds.max(1));
    let (core, mut actions_rx) = RqdCore::new(config, facts.clone(), watcher);

    let (sampler_stop, sampler_stop_rx) = watch::channel(false);
    let sampler = ProcSampler::new(core.registry.clone(), facts, sampler_interval);
    let sampler_task = tokio::spawn(sampler.run(sampler_stop_rx));

    // The server drains when a signal lands or a lifecycle RPC arms a host
    // action; the chosen action travels out through the oneshot.
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ConfigError::Startup(format!("could not install signal handler: {}", e)))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ConfigError::Startup(format!("could not install signal handler: {}", e)))?;

    let (chosen_tx, chosen_rx) = oneshot::channel::<Option<HostAction>>();
    let shutdown = async move {
        let action = tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                None
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                None
            }
            action = actions_rx.recv() => action,
        };
        let _ = chosen_tx.send(action);
    };

    info!(addr = %addr_text, "control plane listening");
    server::serve(core.clone(), addr, shutdown)
        .await
        .map_err(|e| ConfigError::Startup(format!("serving on {} failed: {}", addr_text, e)))?;

    let action = chosen_rx.await.unwrap_or(None);

    // Refuse further work and give running frames a bounded chance to
    // finish before they are cleared.
    core.drain(DRAIN_PATIENCE, KILL_PATIENCE).await;

    let _ = sampler_stop.send(true);
    let _ = sampler_task.await;

    info!(action = ?action, "rqd stopped");
    Ok(action)
}

/// File logging with daily rotation, DEBUG level. Falls back to stderr when
/// the log location is unusable; that is not a startup-fatal condition.
fn init_logging(config: &Config, foreground: bool) -> Option<WorkerGuard> {
    if foreground {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let log_path = Path::new(&config.daemon.log.path);
    let (dir, file_name) = match (log_path.parent(), log_path.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy().to_string()),
        _ => (Path::new("."), "rqd.log".to_string()),
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .build(dir);

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_writer(std::io::stderr)
                .init();
            warn!(
                path = %config.daemon.log.path,
                error = %e,
                "could not open daemon logfile, logging to stderr"
            );
            None
        }
    }
}

/// Replace this process with a fresh image of itself.
fn restart_self() {
    use std::os::unix::process::CommandExt;
    let err = Command::new("/proc/self/exe")
        .args(std::env::args_os().skip(1))
        .exec();
    // exec only returns on failure.
    error!(error = %err, "restart failed, exiting instead");
}

fn reboot_host() {
    match Command::new("/usr/sbin/reboot").status() {
        Ok(status) if status.success() => {}
        Ok(status) => error!(code = ?status.code(), "reboot command failed"),
        Err(e) => error!(error = %e, "could not run reboot command"),
    }
}
