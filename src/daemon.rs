//! Long-running `serve` mode.
//!
//! Only one process may own the scheduling state, so `serve` takes a PID
//! file and refuses to start while another live instance holds it.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::{AppContext, EstuaryError, Result};

pub struct Daemon {
    ctx: AppContext,
}

impl Daemon {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Get the PID file path
    pub fn pid_file_path() -> Option<PathBuf> {
        dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .map(|d| d.join("estuary").join("estuary.pid"))
    }

    /// Check if another instance is already running
    pub fn is_running() -> bool {
        let Some(pid_path) = Self::pid_file_path() else {
            return false;
        };

        fs::read_to_string(pid_path)
            .ok()
            .and_then(|pid| pid.trim().parse::<u32>().ok())
            .is_some_and(Self::process_exists)
    }

    #[cfg(unix)]
    fn process_exists(pid: u32) -> bool {
        use std::process::Command;
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    fn process_exists(pid: u32) -> bool {
        use std::process::Command;
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    fn write_pid_file() -> std::io::Result<()> {
        if let Some(pid_path) = Self::pid_file_path() {
            if let Some(parent) = pid_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&pid_path)?;
            writeln!(file, "{}", std::process::id())?;
        }
        Ok(())
    }

    fn remove_pid_file() {
        if let Some(pid_path) = Self::pid_file_path() {
            let _ = fs::remove_file(pid_path);
        }
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        if Self::is_running() {
            return Err(EstuaryError::Other(
                "Another estuary instance is already running".to_string(),
            ));
        }

        Self::write_pid_file()
            .map_err(|e| EstuaryError::Other(format!("Failed to write PID file: {}", e)))?;

        let result = self.serve().await;
        Self::remove_pid_file();
        result
    }

    async fn serve(&self) -> Result<()> {
        let token = self.ctx.token().clone();
        tokio::spawn(shutdown_on_signal(token.clone()));

        self.ctx.start().await?;
        info!(pid = std::process::id(), "Serving");

        token.cancelled().await;
        info!("Shutting down");
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
        _ = token.cancelled() => return,
    }
    token.cancel();
}

#[cfg(windows)]
async fn shutdown_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => token.cancel(),
        _ = token.cancelled() => {}
    }
}
