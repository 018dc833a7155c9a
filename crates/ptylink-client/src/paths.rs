//! Daemon location and state-path resolution.
//!
//! Priority for the local daemon endpoint:
//! 1. `PTYLINK_DAEMON_SOCKET` (unix socket path, explicit override)
//! 2. `PTYLINK_DAEMON_PORT` (loopback WebSocket port)
//! 3. The default loopback port (separate values for debug and release
//!    builds so a development daemon never collides with an installed one)
//!
//! Priority for the state directory (daemon binary, log file):
//! 1. `PTYLINK_STATE_DIR` (explicit override)
//! 2. `XDG_STATE_HOME/ptylink`
//! 3. `~/.ptylink`
//! 4. System temp dir (last resort)

use std::env;
use std::path::PathBuf;

/// Default loopback port the daemon listens on.
pub const DEFAULT_PORT: u16 = if cfg!(debug_assertions) { 8157 } else { 8147 };

/// Where the local daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    /// Unix domain socket at this path.
    Unix(PathBuf),
    /// WebSocket on a loopback TCP port.
    Tcp(u16),
}

/// Resolve the local daemon endpoint from the environment.
pub fn local_endpoint() -> LocalEndpoint {
    if let Ok(path) = env::var("PTYLINK_DAEMON_SOCKET") {
        if !path.is_empty() {
            return LocalEndpoint::Unix(PathBuf::from(path));
        }
    }
    if let Ok(port) = env::var("PTYLINK_DAEMON_PORT") {
        if let Ok(port) = port.trim().parse::<u16>() {
            return LocalEndpoint::Tcp(port);
        }
    }
    LocalEndpoint::Tcp(DEFAULT_PORT)
}

/// State directory with priority fallback.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("PTYLINK_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Ok(state_home) = env::var("XDG_STATE_HOME") {
        if !state_home.is_empty() {
            return PathBuf::from(state_home).join("ptylink");
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".ptylink");
    }

    env::temp_dir().join("ptylink")
}

/// Where the daemon's stdout/stderr land when the client spawns it.
pub fn daemon_log_path() -> PathBuf {
    state_dir().join("daemon.log")
}

/// Resolve the daemon binary.
///
/// `PTYLINK_DAEMON_BIN` wins; otherwise the copy installed under the state
/// directory is used if present. `None` disables local daemon support.
pub fn daemon_binary() -> Option<PathBuf> {
    if let Ok(bin) = env::var("PTYLINK_DAEMON_BIN") {
        if !bin.is_empty() {
            return Some(PathBuf::from(bin));
        }
    }

    let installed = state_dir().join("bin").join("ptylinkd");
    if installed.exists() {
        return Some(installed);
    }

    None
}

/// Path of the remote endpoint configuration file.
///
/// `PTYLINK_REMOTES` overrides; otherwise the platform config directory,
/// falling back to `~/.ptylink`.
pub fn remotes_config_path() -> PathBuf {
    if let Ok(path) = env::var("PTYLINK_REMOTES") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(config) = dirs::config_dir() {
        return config.join("ptylink").join("remotes.json");
    }

    state_dir().join("remotes.json")
}
