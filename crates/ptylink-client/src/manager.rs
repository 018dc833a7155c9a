//! Process-wide registry of named connections.
//!
//! One manager owns the "local" connection plus zero or more remote
//! connections loaded from configuration, resolves where the local daemon
//! lives, supervises its process, and routes session/attach/list requests
//! to the right connection by name. It is an ordinary value: construct it
//! where the application lifecycle is owned and pass it down; tests build
//! one over fake transports with [`Manager::from_connections`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ptylink_core::config::{EndpointKind, RemoteEndpoint};
use ptylink_core::protocol::{SessionEntry, SessionRequestOptions};

use crate::connection::{Connection, ConnectionConfig, ConnectionState, FailureKind};
use crate::daemon::DaemonSupervisor;
use crate::error::ClientError;
use crate::pane::Pane;
use crate::paths::{self, LocalEndpoint};
use crate::transport::stdio::StdioTransport;
use crate::transport::unix::UnixTransport;
use crate::transport::ws::WebSocketTransport;
use crate::transport::Transport;

/// Name of the implicit local connection.
pub const LOCAL_CONNECTION: &str = "local";

/// Construction options for [`Manager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub connection: ConnectionConfig,
    /// Remote daemons, typically from [`ptylink_core::config::load_endpoints`].
    pub remote_endpoints: Vec<RemoteEndpoint>,
    /// Spawn and supervise the local daemon process. Leave off when some
    /// other component owns the daemon's lifecycle.
    pub manage_local_daemon: bool,
}

/// Registry of named connections plus local daemon supervision.
pub struct Manager {
    connections: HashMap<String, Connection>,
    supervisor: Option<Arc<Mutex<DaemonSupervisor>>>,
    supervisor_task: Option<JoinHandle<()>>,
    daemon_diagnostic: Option<String>,
}

impl Manager {
    /// Build the connection set from the environment and configuration,
    /// spawning the local daemon when asked to and nothing is listening.
    pub async fn new(config: ManagerConfig) -> Self {
        let mut connections = HashMap::new();

        let endpoint = paths::local_endpoint();
        let local = spawn_local_connection(&endpoint, config.connection.clone());
        connections.insert(LOCAL_CONNECTION.to_string(), local.clone());

        for remote in &config.remote_endpoints {
            if connections.contains_key(&remote.name) {
                warn!(name = %remote.name, "skipping remote endpoint with duplicate name");
                continue;
            }
            let connection = spawn_remote_connection(remote, config.connection.clone());
            connections.insert(remote.name.clone(), connection);
        }
        info!(connections = connections.len(), "manager initialized");

        let mut supervisor = None;
        let mut supervisor_task = None;
        let mut daemon_diagnostic = None;
        if config.manage_local_daemon {
            match paths::daemon_binary() {
                Some(binary) => {
                    let mut sup = DaemonSupervisor::new(
                        binary,
                        endpoint.clone(),
                        paths::daemon_log_path(),
                    );
                    sup.ensure_running().await;
                    let sup = Arc::new(Mutex::new(sup));
                    supervisor = Some(sup.clone());
                    supervisor_task = Some(tokio::spawn(supervise_local_daemon(local, sup)));
                }
                None => {
                    info!("no daemon binary found; local daemon support disabled");
                    daemon_diagnostic =
                        Some("daemon binary not found; local sessions disabled".to_string());
                }
            }
        }

        Self {
            connections,
            supervisor,
            supervisor_task,
            daemon_diagnostic,
        }
    }

    /// Build a manager over pre-constructed connections. The first
    /// connection named [`LOCAL_CONNECTION`] (if any) becomes the default
    /// routing target.
    pub fn from_connections(connections: impl IntoIterator<Item = Connection>) -> Self {
        let connections = connections
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            connections,
            supervisor: None,
            supervisor_task: None,
            daemon_diagnostic: None,
        }
    }

    /// Look up a connection by name; `None` means the local connection.
    pub fn connection(&self, name: Option<&str>) -> Result<&Connection, ClientError> {
        let name = name.unwrap_or(LOCAL_CONNECTION);
        self.connections
            .get(name)
            .ok_or_else(|| ClientError::ConnectionNotFound(name.to_string()))
    }

    pub fn connection_names(&self) -> Vec<&str> {
        self.connections.keys().map(String::as_str).collect()
    }

    /// Create a session on the named connection.
    pub async fn request_session(
        &self,
        connection: Option<&str>,
        options: SessionRequestOptions,
    ) -> Result<Pane, ClientError> {
        self.connection(connection)?.request_session(options).await
    }

    /// Attach to an existing session on the named connection.
    pub async fn attach_session(
        &self,
        connection: Option<&str>,
        session_id: &str,
    ) -> Result<Pane, ClientError> {
        self.connection(connection)?.attach_session(session_id).await
    }

    /// Enumerate sessions on the named connection.
    pub async fn list_sessions(
        &self,
        connection: Option<&str>,
    ) -> Result<Vec<SessionEntry>, ClientError> {
        self.connection(connection)?.list_sessions().await
    }

    /// Why the local daemon is unavailable, if it is.
    pub async fn daemon_diagnostic(&self) -> Option<String> {
        if let Some(diagnostic) = &self.daemon_diagnostic {
            return Some(diagnostic.clone());
        }
        match &self.supervisor {
            Some(sup) => sup.lock().await.diagnostic().map(str::to_string),
            None => None,
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor_task.take() {
            task.abort();
        }
    }
}

fn spawn_local_connection(endpoint: &LocalEndpoint, config: ConnectionConfig) -> Connection {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn Transport> = match endpoint {
        LocalEndpoint::Unix(path) => Arc::new(UnixTransport::new(path.clone(), events_tx)),
        LocalEndpoint::Tcp(port) => Arc::new(WebSocketTransport::new(
            format!("ws://127.0.0.1:{}/link", port),
            events_tx,
        )),
    };
    Connection::spawn(LOCAL_CONNECTION, transport, events_rx, config)
}

fn spawn_remote_connection(endpoint: &RemoteEndpoint, config: ConnectionConfig) -> Connection {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn Transport> = match &endpoint.kind {
        EndpointKind::Ws { url } => Arc::new(WebSocketTransport::new(url.clone(), events_tx)),
        EndpointKind::Unix { path } => Arc::new(UnixTransport::new(path.clone(), events_tx)),
        EndpointKind::Ssh {
            host,
            user,
            command,
        } => {
            let target = match user {
                Some(user) => format!("{}@{}", user, host),
                None => host.clone(),
            };
            let remote_command = command.clone().unwrap_or_else(|| "ptylinkd --stdio".to_string());
            Arc::new(StdioTransport::new(
                "ssh",
                vec![target, remote_command],
                events_tx,
            ))
        }
        EndpointKind::Stdio { command, args } => {
            Arc::new(StdioTransport::new(command.clone(), args.clone(), events_tx))
        }
    };
    Connection::spawn(endpoint.name.clone(), transport, events_rx, config)
}

/// Watch the local connection; a handshake timeout against a dead daemon
/// triggers a debounced restart and a reconnect kick.
async fn supervise_local_daemon(local: Connection, supervisor: Arc<Mutex<DaemonSupervisor>>) {
    let mut state_rx = local.watch_state();
    loop {
        if state_rx.changed().await.is_err() {
            return;
        }
        let handshake_timed_out = matches!(
            &*state_rx.borrow_and_update(),
            ConnectionState::Failed(failure) if failure.kind == FailureKind::HandshakeTimeout
        );
        if handshake_timed_out {
            let restarted = supervisor.lock().await.restart_if_needed().await;
            if restarted {
                local.connect();
            }
        }
    }
}
