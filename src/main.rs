//! Agentco CLI entry point.

use agentco::api::state::ApiState;
use agentco::api::ws::Broadcaster;
use agentco::config::CompanyConfig;
use agentco::daemon::{self, DaemonPaths, IpcCommand, IpcResponse};
use agentco::gateway::{CallLog, HttpGateway};
use agentco::trigger::TriggerEngine;
use agentco::watchdog::Watchdog;
use agentco::CompanyDeps;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "agentco", version)]
#[command(about = "A persistent multi-agent company core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand is given)
    Start {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the running server
    Stop,
    /// Restart the server (stop + start)
    Restart {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show status of the running server
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Start { foreground: false });

    match command {
        Command::Start { foreground } => start(foreground, cli.debug),
        Command::Stop => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(stop())
        }
        Command::Restart { foreground } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(stop())?;
            drop(runtime);
            start(foreground, cli.debug)
        }
        Command::Status => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(status())
        }
    }
}

fn start(foreground: bool, debug: bool) -> anyhow::Result<()> {
    let config = CompanyConfig::load()?;
    let paths = DaemonPaths::new(&config.state_dir);

    if let Some(pid) = daemon::is_running(&paths) {
        anyhow::bail!("agentco is already running (pid {pid})");
    }

    let _guard;
    if foreground {
        daemon::init_foreground_tracing(debug);
    } else {
        // Fork before the runtime exists; tokio does not survive fork.
        daemon::daemonize(&paths)?;
        _guard = daemon::init_background_tracing(&paths, debug);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    runtime.block_on(run_server(config, paths, foreground))
}

async fn run_server(
    config: CompanyConfig,
    paths: DaemonPaths,
    foreground: bool,
) -> anyhow::Result<()> {
    let started_at = std::time::Instant::now();
    tracing::info!(
        state_dir = %config.state_dir.display(),
        agents = config.agents.len(),
        "starting agentco"
    );

    if foreground {
        std::fs::write(&paths.pid_file, std::process::id().to_string())
            .context("failed to write pid file")?;
    }

    let channels_pool = agentco::db::open_channels_db(&config.channels_db_path()).await?;
    let tasks_pool = agentco::db::open_tasks_db(&config.tasks_db_path()).await?;

    let call_log = CallLog::new(config.llm_call_log_file.clone());
    let gateway = Arc::new(HttpGateway::new(
        config.gateway_url.clone(),
        Some(call_log.clone()),
    ));

    let deps = CompanyDeps {
        config: Arc::new(config),
        channel_store: Arc::new(agentco::channels::ChannelStore::new(channels_pool.clone())),
        task_store: Arc::new(agentco::tasks::TaskStore::new(tasks_pool.clone())),
        gateway,
        broadcaster: Broadcaster::new(),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let trigger = Arc::new(TriggerEngine::new(deps.clone()));
    let trigger_handles = trigger.start(shutdown_rx.clone());

    let watchdog = Arc::new(Watchdog::new(deps.clone()));
    let watchdog_handle = watchdog.start(shutdown_rx.clone());

    let state = Arc::new(ApiState::new(deps.clone(), call_log));
    let http_handle =
        agentco::api::server::start_http_server(deps.config.http_bind, state, shutdown_rx.clone())
            .await?;

    let ipc_handle =
        daemon::start_ipc_server(paths.socket.clone(), shutdown_tx.clone(), started_at)?;

    // Run until Ctrl-C or an IPC shutdown flips the flag.
    let mut shutdown_rx = shutdown_rx;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = shutdown_rx.wait_for(|stop| *stop) => {}
    }

    // Ordered shutdown: watchdog and trigger first (no new gateway calls),
    // then drain in-flight RPCs, then the servers, then the stores.
    let _ = watchdog_handle.await;
    for handle in trigger_handles {
        let _ = handle.await;
    }
    trigger.drain(Duration::from_secs(5)).await;

    let _ = http_handle.await;
    let _ = ipc_handle.await;

    channels_pool.close().await;
    tasks_pool.close().await;

    let _ = std::fs::remove_file(&paths.pid_file);
    tracing::info!("agentco stopped");
    Ok(())
}

async fn stop() -> anyhow::Result<()> {
    let config = CompanyConfig::load()?;
    let paths = DaemonPaths::new(&config.state_dir);

    let Some(pid) = daemon::is_running(&paths) else {
        println!("agentco is not running");
        return Ok(());
    };

    match daemon::send_command(&paths, IpcCommand::Shutdown).await? {
        IpcResponse::Ok => {}
        IpcResponse::Error { message } => anyhow::bail!("daemon refused shutdown: {message}"),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }

    // Wait for the process to actually exit so a follow-up start does not
    // race the old instance.
    for _ in 0..100 {
        if daemon::is_running(&paths).is_none() {
            println!("agentco (pid {pid}) stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("agentco (pid {pid}) did not exit within 10s")
}

async fn status() -> anyhow::Result<()> {
    let config = CompanyConfig::load()?;
    let paths = DaemonPaths::new(&config.state_dir);

    if daemon::is_running(&paths).is_none() {
        println!("agentco is not running");
        return Ok(());
    }

    match daemon::send_command(&paths, IpcCommand::Status).await? {
        IpcResponse::Status {
            pid,
            uptime_seconds,
        } => {
            println!("agentco running: pid {pid}, up {uptime_seconds}s");
            Ok(())
        }
        IpcResponse::Error { message } => anyhow::bail!("daemon error: {message}"),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}
