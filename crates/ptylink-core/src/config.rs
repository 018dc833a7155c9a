//! Remote endpoint configuration.
//!
//! Remote daemons are listed in a JSON file: an array of endpoint objects,
//! each with an `id`, a display `name`, and a `type` plus type-specific
//! fields. A missing file means no remote connections, which is the common
//! case.
//!
//! ```json
//! [
//!   {"id": "wk", "name": "workstation", "type": "ws", "url": "wss://wk.example:8147/link"},
//!   {"id": "vm", "name": "build vm", "type": "ssh", "host": "build.local", "user": "ci"}
//! ]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a remote endpoint's byte stream is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointKind {
    /// Persistent WebSocket connection.
    Ws { url: String },
    /// Unix domain socket (daemon on this machine, e.g. inside a sandbox).
    Unix { path: PathBuf },
    /// Daemon reached by running `ssh` and framing over its stdio.
    Ssh {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        /// Remote command that starts the daemon in stdio mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// Arbitrary subprocess speaking the protocol on stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// One configured remote daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub id: String,
    /// Connection name used for routing; must be unique.
    pub name: String,
    #[serde(flatten)]
    pub kind: EndpointKind,
}

/// Errors from loading the endpoint configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate endpoint name '{0}'")]
    DuplicateName(String),
}

/// Load the remote endpoint list. A missing file yields an empty list.
pub fn load_endpoints(path: &Path) -> Result<Vec<RemoteEndpoint>, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let endpoints: Vec<RemoteEndpoint> =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut seen = HashSet::new();
    for endpoint in &endpoints {
        if !seen.insert(endpoint.name.as_str()) {
            return Err(ConfigError::DuplicateName(endpoint.name.clone()));
        }
    }

    Ok(endpoints)
}
