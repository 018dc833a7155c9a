//! Local daemon process supervision.
//!
//! The daemon itself is a black box: the client only knows how to spawn
//! it, probe whether something is listening on its endpoint, and restart
//! it (debounced) when a handshake times out against a dead instance.
//! Its stdout/stderr are captured to a log file under the state directory.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::paths::LocalEndpoint;

/// Maximum time to wait for a spawned daemon to start listening.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between listen probes during startup.
const STARTUP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for a single connect-and-disconnect probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Minimum spacing between handshake-triggered restarts.
pub(crate) const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

/// Probe whether anything is listening on the daemon endpoint.
///
/// A short-timeout connect-and-disconnect; used to skip spawning at
/// startup and to decide whether a handshake timeout warrants a restart.
pub async fn is_listening(endpoint: &LocalEndpoint) -> bool {
    match endpoint {
        LocalEndpoint::Unix(path) => {
            matches!(timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await, Ok(Ok(_)))
        }
        LocalEndpoint::Tcp(port) => matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", *port))).await,
            Ok(Ok(_))
        ),
    }
}

/// Spawns and restarts the local daemon process.
pub struct DaemonSupervisor {
    binary: PathBuf,
    endpoint: LocalEndpoint,
    log_path: PathBuf,
    child: Option<Child>,
    last_spawn: Option<Instant>,
    diagnostic: Option<String>,
}

impl DaemonSupervisor {
    pub fn new(binary: PathBuf, endpoint: LocalEndpoint, log_path: PathBuf) -> Self {
        Self {
            binary,
            endpoint,
            log_path,
            child: None,
            last_spawn: None,
            diagnostic: None,
        }
    }

    /// Last spawn failure, surfaced to callers on request.
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Make sure a daemon is serving the endpoint, spawning one if nothing
    /// is listening. Spawn failures are recorded, not propagated: the
    /// connection keeps retrying and the caller can ask for the diagnostic.
    pub async fn ensure_running(&mut self) {
        if is_listening(&self.endpoint).await {
            debug!("daemon already listening; not spawning");
            return;
        }
        match self.spawn_and_wait().await {
            Ok(()) => self.diagnostic = None,
            Err(e) => {
                warn!(error = %e, "failed to start local daemon");
                self.diagnostic = Some(format!("{:#}", e));
            }
        }
    }

    /// Restart after a handshake timeout, at most once per cooldown window
    /// and only when nothing else is listening. Returns whether a spawn
    /// was attempted.
    pub async fn restart_if_needed(&mut self) -> bool {
        if is_listening(&self.endpoint).await {
            debug!("daemon is listening; handshake timeout was not ours to fix");
            return false;
        }
        if let Some(last) = self.last_spawn {
            if last.elapsed() < RESTART_COOLDOWN {
                debug!("daemon restart debounced");
                return false;
            }
        }
        info!("restarting local daemon");
        match self.spawn_and_wait().await {
            Ok(()) => {
                self.diagnostic = None;
                true
            }
            Err(e) => {
                warn!(error = %e, "daemon restart failed");
                self.diagnostic = Some(format!("{:#}", e));
                true
            }
        }
    }

    async fn spawn_and_wait(&mut self) -> Result<()> {
        self.spawn_daemon()?;
        self.wait_until_listening().await
    }

    /// Spawn the daemon as a detached background process.
    ///
    /// `process_group(0)` makes the daemon its own group leader so it does
    /// not die with the frontend's terminal.
    fn spawn_daemon(&mut self) -> Result<()> {
        use std::os::unix::process::CommandExt;

        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {:?}", parent))?;
        }
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("failed to open daemon log {:?}", self.log_path))?;
        {
            use std::io::Write;
            let _ = writeln!(log, "--- daemon spawned {} ---", Utc::now().to_rfc3339());
        }

        let mut cmd = Command::new(&self.binary);
        match &self.endpoint {
            LocalEndpoint::Unix(path) => {
                cmd.arg("--socket").arg(path);
            }
            LocalEndpoint::Tcp(port) => {
                cmd.arg("--port").arg(port.to_string());
            }
        }
        if let Some(home) = dirs::home_dir() {
            cmd.current_dir(home);
        }
        cmd.env("TERM", "xterm-256color")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone().context("failed to clone log handle")?))
            .stderr(Stdio::from(log))
            .process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn daemon {:?}", self.binary))?;
        info!(binary = %self.binary.display(), pid = child.id(), "spawned local daemon");

        self.child = Some(child);
        self.last_spawn = Some(Instant::now());
        Ok(())
    }

    /// Wait for the endpoint to accept connections, detecting an early
    /// crash for a faster, clearer error than the full timeout.
    async fn wait_until_listening(&mut self) -> Result<()> {
        let start = Instant::now();

        loop {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        bail!(
                            "daemon exited immediately with {} (see {:?})",
                            status,
                            self.log_path
                        );
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "could not check daemon status"),
                }
            }

            if is_listening(&self.endpoint).await {
                info!("daemon listening after {:?}", start.elapsed());
                return Ok(());
            }

            if start.elapsed() > STARTUP_TIMEOUT {
                bail!("daemon did not start listening within {:?}", STARTUP_TIMEOUT);
            }
            tokio::time::sleep(STARTUP_RETRY_INTERVAL).await;
        }
    }
}
