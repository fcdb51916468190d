//! Process daemonization and IPC for background operation.

use anyhow::{anyhow, Context as _};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::PathBuf;
use std::time::Instant;

/// Commands sent from the CLI client to the running daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcCommand {
    Shutdown,
    Status,
}

/// Responses from the daemon back to the CLI client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok,
    Status { pid: u32, uptime_seconds: u64 },
    Error { message: String },
}

/// Paths for daemon runtime files, all derived from the state directory.
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub socket: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            pid_file: state_dir.join("agentco.pid"),
            socket: state_dir.join("agentco.sock"),
            log_dir: state_dir.join("logs"),
        }
    }
}

/// Check whether a daemon is already running by testing PID file liveness
/// and socket connectivity.
pub fn is_running(paths: &DaemonPaths) -> Option<u32> {
    let pid = read_pid_file(&paths.pid_file)?;

    if !is_process_alive(pid) {
        cleanup_stale_files(paths);
        return None;
    }

    if paths.socket.exists() {
        if let Ok(stream) = std::os::unix::net::UnixStream::connect(&paths.socket) {
            drop(stream);
            return Some(pid);
        }
        // Socket exists but can't connect — stale.
        cleanup_stale_files(paths);
        return None;
    }

    // PID alive but no socket — process may still be starting up. Trust it.
    Some(pid)
}

fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn cleanup_stale_files(paths: &DaemonPaths) {
    let _ = std::fs::remove_file(&paths.pid_file);
    let _ = std::fs::remove_file(&paths.socket);
}

/// Daemonize the current process. Returns in the child; the parent exits.
pub fn daemonize(paths: &DaemonPaths) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.log_dir).with_context(|| {
        format!(
            "failed to create log directory: {}",
            paths.log_dir.display()
        )
    })?;

    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_dir.join("agentco.out"))
        .context("failed to open stdout log")?;

    let stderr = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_dir.join("agentco.err"))
        .context("failed to open stderr log")?;

    daemonize::Daemonize::new()
        .pid_file(&paths.pid_file)
        .chown_pid_file(true)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|error| anyhow!("failed to daemonize: {error}"))?;

    Ok(())
}

/// Initialize tracing for foreground mode: stderr, env-filter controlled.
pub fn init_foreground_tracing(debug: bool) {
    let default_filter = if debug { "agentco=debug,info" } else { "agentco=info,warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize tracing for background (daemon) mode: daily-rolling files.
///
/// The returned guard must be held for the process lifetime so buffered
/// lines flush on exit.
pub fn init_background_tracing(
    paths: &DaemonPaths,
    debug: bool,
) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "agentco.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if debug { "agentco=debug,info" } else { "agentco=info,warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    guard
}

/// Serve IPC commands on the unix socket. `Shutdown` flips the shared
/// shutdown flag; `Status` reports pid and uptime.
pub fn start_ipc_server(
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind IPC socket: {}", socket_path.display()))?;

    let handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    handle_ipc_client(stream, &shutdown_tx, started_at).await;
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
        tracing::debug!("IPC server stopped");
    });

    Ok(handle)
}

async fn handle_ipc_client(stream: UnixStream, shutdown_tx: &watch::Sender<bool>, started_at: Instant) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(reader).lines();

    let Ok(Some(line)) = lines.next_line().await else {
        return;
    };

    let response = match serde_json::from_str::<IpcCommand>(&line) {
        Ok(IpcCommand::Shutdown) => {
            tracing::info!("shutdown requested over IPC");
            let _ = shutdown_tx.send(true);
            IpcResponse::Ok
        }
        Ok(IpcCommand::Status) => IpcResponse::Status {
            pid: std::process::id(),
            uptime_seconds: started_at.elapsed().as_secs(),
        },
        Err(error) => IpcResponse::Error {
            message: format!("bad command: {error}"),
        },
    };

    if let Ok(mut json) = serde_json::to_string(&response) {
        json.push('\n');
        let _ = writer.write_all(json.as_bytes()).await;
    }
}

/// Send one command to a running daemon and read its reply.
pub async fn send_command(paths: &DaemonPaths, command: IpcCommand) -> anyhow::Result<IpcResponse> {
    let stream = UnixStream::connect(&paths.socket)
        .await
        .with_context(|| format!("failed to connect to daemon: {}", paths.socket.display()))?;

    let (reader, mut writer) = stream.into_split();
    let mut json = serde_json::to_string(&command).context("failed to encode IPC command")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("failed to send IPC command")?;

    let mut lines = tokio::io::BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await
        .context("failed to read IPC response")?
        .ok_or_else(|| anyhow!("daemon closed the connection without replying"))?;

    serde_json::from_str(&line).context("failed to decode IPC response")
}
