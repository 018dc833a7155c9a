//! Connection state machine.
//!
//! One [`Connection`] multiplexes every pane of one daemon over a single
//! transport. All state lives in an actor task; handles communicate with
//! it over a command channel, so no two pieces of connection logic ever
//! run concurrently and caller completions are never invoked from inside
//! a state mutation.
//!
//! The actor owns the handshake (`hello`/`welcome` with periodic resends
//! up to an absolute deadline), the capability set, the reconnect policy
//! (exponential backoff, or fixed-interval polling while the local socket
//! file does not exist yet), a FIFO session-creation queue with at most
//! one request in flight, a deduplicated attach-request set, and the
//! registry of live panes. Queued work survives a reconnect; a failed
//! connection with nothing pending stays down until the next caller
//! operation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ptylink_core::protocol::{
    self, Capabilities, ClientMessage, DaemonMessage, SessionEntry, SessionRequestOptions,
    PROTOCOL_VERSION,
};

use crate::error::ClientError;
use crate::pane::{self, CursorStyle, Pane, PaneMsg, PaneSyncConfig};
use crate::transport::{Transport, TransportEvent};

/// Why a connection entered the failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transport died: socket error, process exit, read EOF.
    Transport,
    /// No `welcome` arrived before the handshake deadline.
    HandshakeTimeout,
    /// The daemon sent an `error` message.
    Daemon,
}

/// A failure reason with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Connection lifecycle states. Published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed(Failure),
}

/// Timing and behavior knobs. Defaults match the production daemon.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between `hello` resends while connecting.
    pub hello_interval: Duration,
    /// Absolute limit on one connection attempt; tolerates a daemon that
    /// is mid-startup without giving up prematurely.
    pub handshake_deadline: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Reconnect interval while the local socket file does not exist.
    pub socket_poll_interval: Duration,
    pub snapshot_timeout: Duration,
    pub replay_window: Duration,
    /// Cursor shape synthesized after each snapshot, if configured.
    pub cursor_style: Option<CursorStyle>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hello_interval: Duration::from_secs(2),
            handshake_deadline: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(15),
            socket_poll_interval: Duration::from_millis(250),
            snapshot_timeout: Duration::from_millis(400),
            replay_window: Duration::from_secs(3),
            cursor_style: None,
        }
    }
}

/// Commands handles send into the actor.
pub(crate) enum Command {
    RequestSession {
        options: SessionRequestOptions,
        reply: oneshot::Sender<Result<Pane, ClientError>>,
    },
    AttachSession {
        session_id: String,
        reply: oneshot::Sender<Result<Pane, ClientError>>,
    },
    ListSessions {
        reply: oneshot::Sender<Result<Vec<SessionEntry>, ClientError>>,
    },
    Input {
        pane_id: String,
        data: Vec<u8>,
    },
    Resize {
        pane_id: String,
        cols: u16,
        rows: u16,
    },
    ClosePane {
        pane_id: String,
    },
    /// Kick a disconnected connection without issuing a request.
    Connect,
    DefaultSessionId {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Handle to one daemon connection.
///
/// Cheap to clone; all clones address the same actor. The actor lives as
/// long as any handle (or any pane created through it) exists.
#[derive(Clone)]
pub struct Connection {
    name: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Spawn the actor for one transport.
    ///
    /// `transport_events` must be the receiving end of the channel the
    /// transport was constructed with. The connection stays disconnected
    /// until the first operation (or [`Connection::connect`]) arrives.
    pub fn spawn(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: ConnectionConfig,
    ) -> Self {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ConnectionActor {
            name: name.clone(),
            transport,
            transport_events,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            state_tx,
            state: ConnectionState::Disconnected,
            config,
            capabilities: Capabilities::default(),
            default_session_id: None,
            session_queue: VecDeque::new(),
            session_in_flight: false,
            list_queue: VecDeque::new(),
            attach_waiters: HashMap::new(),
            attach_sent: HashSet::new(),
            panes: HashMap::new(),
            reconnect_attempts: 0,
            handshake_deadline: None,
            next_hello: None,
            reconnect_at: None,
        };
        tokio::spawn(actor.run());

        Self {
            name,
            cmd_tx,
            state_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Begin connecting without issuing a request.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Create a new PTY session.
    ///
    /// Queued FIFO; completes once the daemon acknowledges creation, even
    /// if that takes a reconnect or two.
    pub async fn request_session(
        &self,
        options: SessionRequestOptions,
    ) -> Result<Pane, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RequestSession { options, reply })
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Attach to an existing session by id.
    pub async fn attach_session(&self, session_id: impl Into<String>) -> Result<Pane, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AttachSession {
                session_id: session_id.into(),
                reply,
            })
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Enumerate the daemon's sessions.
    pub async fn list_sessions(&self) -> Result<Vec<SessionEntry>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ListSessions { reply })
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Default session advertised by the daemon in `welcome`, if any.
    pub async fn default_session_id(&self) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::DefaultSessionId { reply })
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    // Past 2^16 the product is beyond any sane cap anyway.
    let factor = 1u32 << attempt.min(16);
    cap.min(base.saturating_mul(factor))
}

struct PendingSession {
    options: SessionRequestOptions,
    reply: oneshot::Sender<Result<Pane, ClientError>>,
}

struct PaneEntry {
    pump: mpsc::UnboundedSender<PaneMsg>,
    session_id: Option<String>,
}

struct ConnectionActor {
    name: String,
    transport: Arc<dyn Transport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    config: ConnectionConfig,

    capabilities: Capabilities,
    default_session_id: Option<String>,

    session_queue: VecDeque<PendingSession>,
    /// A creation message has been sent and not yet acknowledged.
    session_in_flight: bool,
    list_queue: VecDeque<oneshot::Sender<Result<Vec<SessionEntry>, ClientError>>>,
    attach_waiters: HashMap<String, Vec<oneshot::Sender<Result<Pane, ClientError>>>>,
    /// Session ids with an `attach_session` message outstanding.
    attach_sent: HashSet<String>,
    panes: HashMap<String, PaneEntry>,

    reconnect_attempts: u32,
    handshake_deadline: Option<Instant>,
    next_hello: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Every handle and pane is gone; nothing can reach us again.
                    None => break,
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!(connection = %self.name, "transport event channel closed");
                        break;
                    }
                },
                _ = timer => self.handle_deadlines().await,
            }
        }

        self.transport.close().await;
        debug!(connection = %self.name, "connection actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.reconnect_at, self.handshake_deadline, self.next_hello]
            .into_iter()
            .flatten()
            .min()
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.begin_connect().await;
            return;
        }

        if !matches!(self.state, ConnectionState::Connecting) {
            return;
        }
        if self.handshake_deadline.is_some_and(|at| at <= now) {
            self.on_failure(FailureKind::HandshakeTimeout, "handshake timed out".to_string())
                .await;
            return;
        }
        if self.next_hello.is_some_and(|at| at <= now) {
            debug!(connection = %self.name, "resending hello");
            self.next_hello = Some(now + self.config.hello_interval);
            self.send_hello().await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RequestSession { options, reply } => {
                self.session_queue.push_back(PendingSession { options, reply });
                self.ensure_connected().await;
                if matches!(self.state, ConnectionState::Ready) {
                    self.flush_session_queue().await;
                }
            }
            Command::AttachSession { session_id, reply } => {
                if matches!(self.state, ConnectionState::Ready)
                    && !self.capabilities.supports_sessions()
                {
                    let _ = reply.send(Err(ClientError::AttachUnsupported));
                    return;
                }
                self.attach_waiters
                    .entry(session_id.clone())
                    .or_default()
                    .push(reply);
                self.ensure_connected().await;
                if matches!(self.state, ConnectionState::Ready) {
                    self.send_attach(&session_id).await;
                }
            }
            Command::ListSessions { reply } => {
                self.list_queue.push_back(reply);
                self.ensure_connected().await;
                if matches!(self.state, ConnectionState::Ready) {
                    let msg = self.list_message();
                    self.send_message(&msg).await;
                }
            }
            Command::Input { pane_id, data } => {
                self.ensure_connected().await;
                if matches!(self.state, ConnectionState::Ready) && self.panes.contains_key(&pane_id)
                {
                    self.send_message(&ClientMessage::Input { pane_id, data }).await;
                } else {
                    debug!(connection = %self.name, %pane_id, "dropping input while not ready");
                }
            }
            Command::Resize {
                pane_id,
                cols,
                rows,
            } => {
                self.ensure_connected().await;
                if matches!(self.state, ConnectionState::Ready) && self.panes.contains_key(&pane_id)
                {
                    self.send_message(&ClientMessage::Resize {
                        pane_id,
                        cols,
                        rows,
                    })
                    .await;
                }
            }
            Command::ClosePane { pane_id } => {
                if matches!(self.state, ConnectionState::Ready) {
                    self.send_message(&ClientMessage::ClosePane {
                        pane_id: pane_id.clone(),
                    })
                    .await;
                }
                // Dropping the pump sender ends the pane's pump task and
                // cancels any pending snapshot timers.
                self.panes.remove(&pane_id);
            }
            Command::Connect => self.ensure_connected().await,
            Command::DefaultSessionId { reply } => {
                let _ = reply.send(self.default_session_id.clone());
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => match protocol::decode_line::<DaemonMessage>(&text) {
                Ok(msg) => self.handle_daemon_message(msg).await,
                Err(e) => {
                    debug!(connection = %self.name, error = %e, "dropping malformed message");
                }
            },
            TransportEvent::Closed(reason) => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Ready
                ) {
                    self.on_failure(FailureKind::Transport, reason).await;
                }
            }
        }
    }

    async fn handle_daemon_message(&mut self, msg: DaemonMessage) {
        match msg {
            DaemonMessage::Welcome {
                capabilities,
                session_id,
            } => {
                if !matches!(self.state, ConnectionState::Connecting) {
                    debug!(connection = %self.name, "ignoring welcome outside handshake");
                    return;
                }
                self.capabilities = Capabilities::new(capabilities);
                self.default_session_id = session_id;
                self.reconnect_attempts = 0;
                self.handshake_deadline = None;
                self.next_hello = None;
                self.set_state(ConnectionState::Ready);
                info!(
                    connection = %self.name,
                    capabilities = ?self.capabilities.tokens(),
                    "handshake complete"
                );
                self.flush_session_queue().await;
                self.flush_list_queue().await;
                self.flush_attach_requests().await;
            }
            DaemonMessage::Capabilities { capabilities } => {
                self.capabilities = Capabilities::new(capabilities);
            }
            DaemonMessage::SessionCreated {
                pane_id,
                session_id,
            }
            | DaemonMessage::PaneCreated {
                pane_id,
                session_id,
            } => {
                if !self.session_in_flight {
                    debug!(connection = %self.name, %pane_id, "unsolicited creation ack");
                    return;
                }
                self.session_in_flight = false;
                match self.session_queue.pop_front() {
                    Some(pending) => {
                        let pane = self.register_pane(pane_id, session_id, false);
                        let _ = pending.reply.send(Ok(pane));
                    }
                    None => debug!(connection = %self.name, "creation ack with empty queue"),
                }
                self.flush_session_queue().await;
            }
            DaemonMessage::SessionAttached {
                session_id,
                pane_id,
            } => self.handle_session_attached(session_id, pane_id).await,
            DaemonMessage::Sessions { sessions } | DaemonMessage::Panes { panes: sessions } => {
                match self.list_queue.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(Ok(sessions));
                    }
                    None => debug!(connection = %self.name, "enumeration reply with no waiter"),
                }
            }
            DaemonMessage::Output { pane_id, data } => {
                self.route_to_pane(&pane_id, PaneMsg::Output(data));
            }
            DaemonMessage::Snapshot {
                pane_id,
                data,
                cols,
                rows,
            } => {
                self.route_to_pane(&pane_id, PaneMsg::Snapshot { data, cols, rows });
            }
            DaemonMessage::TitleUpdate { pane_id, title } => {
                self.route_to_pane(&pane_id, PaneMsg::Title(title));
            }
            DaemonMessage::CwdUpdate { pane_id, cwd } => {
                self.route_to_pane(&pane_id, PaneMsg::Cwd(cwd));
            }
            DaemonMessage::Notify {
                pane_id,
                title,
                body,
            } => {
                self.route_to_pane(&pane_id, PaneMsg::Notify { title, body });
            }
            DaemonMessage::PaneExited { pane_id, exit_code } => {
                if let Some(entry) = self.panes.remove(&pane_id) {
                    let _ = entry.pump.send(PaneMsg::Exited(exit_code));
                } else {
                    debug!(connection = %self.name, %pane_id, "exit for unknown pane");
                }
            }
            DaemonMessage::Error { message } => {
                self.on_failure(FailureKind::Daemon, message).await;
            }
        }
    }

    async fn handle_session_attached(&mut self, session_id: String, pane_id: String) {
        self.attach_sent.remove(&session_id);
        let waiters = self.attach_waiters.remove(&session_id).unwrap_or_default();

        let existing = self.panes.iter().find_map(|(id, entry)| {
            (entry.session_id.as_deref() == Some(session_id.as_str())).then(|| id.clone())
        });

        if let Some(old_pane_id) = existing {
            // Reattach of a surviving pane: the daemon may assign a fresh
            // pane id, so re-key the registry and reset sync state.
            if let Some(entry) = self.panes.remove(&old_pane_id) {
                let _ = entry.pump.send(PaneMsg::Resync);
                self.panes.insert(pane_id.clone(), entry);
            }
            self.send_message(&ClientMessage::SnapshotRequest {
                pane_id: pane_id.clone(),
            })
            .await;
            for waiter in waiters {
                let _ = waiter.send(Ok(Pane::new(
                    pane_id.clone(),
                    Some(session_id.clone()),
                    self.name.clone(),
                    self.cmd_tx.clone(),
                    None,
                )));
            }
        } else {
            let (pump_tx, event_rx, _task) = pane::spawn_pump(
                pane_id.clone(),
                self.pane_sync_config(),
                /* start_in_resync */ true,
            );
            self.panes.insert(
                pane_id.clone(),
                PaneEntry {
                    pump: pump_tx,
                    session_id: Some(session_id.clone()),
                },
            );
            self.send_message(&ClientMessage::SnapshotRequest {
                pane_id: pane_id.clone(),
            })
            .await;

            // Every waiter gets a handle; only the first can consume events.
            let mut event_rx = Some(event_rx);
            for waiter in waiters {
                let _ = waiter.send(Ok(Pane::new(
                    pane_id.clone(),
                    Some(session_id.clone()),
                    self.name.clone(),
                    self.cmd_tx.clone(),
                    event_rx.take(),
                )));
            }
        }
    }

    fn route_to_pane(&mut self, pane_id: &str, msg: PaneMsg) {
        match self.panes.get(pane_id) {
            Some(entry) => {
                let _ = entry.pump.send(msg);
            }
            None => debug!(connection = %self.name, %pane_id, "message for unknown pane"),
        }
    }

    fn register_pane(
        &mut self,
        pane_id: String,
        session_id: Option<String>,
        start_in_resync: bool,
    ) -> Pane {
        let (pump_tx, event_rx, _task) =
            pane::spawn_pump(pane_id.clone(), self.pane_sync_config(), start_in_resync);
        self.panes.insert(
            pane_id.clone(),
            PaneEntry {
                pump: pump_tx,
                session_id: session_id.clone(),
            },
        );
        Pane::new(
            pane_id,
            session_id,
            self.name.clone(),
            self.cmd_tx.clone(),
            Some(event_rx),
        )
    }

    fn pane_sync_config(&self) -> PaneSyncConfig {
        PaneSyncConfig {
            snapshot_timeout: self.config.snapshot_timeout,
            replay_window: self.config.replay_window,
            cursor_style: self.config.cursor_style,
        }
    }

    async fn ensure_connected(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Failed(_)
        ) {
            self.begin_connect().await;
        }
    }

    async fn begin_connect(&mut self) {
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        info!(connection = %self.name, "connecting");

        match self.transport.connect().await {
            Ok(()) => {
                let now = Instant::now();
                self.handshake_deadline = Some(now + self.config.handshake_deadline);
                self.next_hello = Some(now + self.config.hello_interval);
                self.send_hello().await;
            }
            Err(e) => {
                self.on_failure(FailureKind::Transport, format!("connect failed: {}", e))
                    .await;
            }
        }
    }

    async fn on_failure(&mut self, kind: FailureKind, message: String) {
        if matches!(self.state, ConnectionState::Failed(_)) {
            return;
        }
        warn!(connection = %self.name, %message, "connection failed");

        self.transport.close().await;
        // Clear in-flight markers so queued work is retried after reconnect.
        self.session_in_flight = false;
        self.attach_sent.clear();
        self.handshake_deadline = None;
        self.next_hello = None;
        self.capabilities = Capabilities::default();
        self.set_state(ConnectionState::Failed(Failure { kind, message }));

        if self.has_pending_work() {
            self.schedule_reconnect();
        } else {
            debug!(connection = %self.name, "no pending work; staying disconnected");
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.session_queue.is_empty()
            || !self.list_queue.is_empty()
            || !self.attach_waiters.is_empty()
            || !self.panes.is_empty()
    }

    fn schedule_reconnect(&mut self) {
        let delay = match self.transport.local_socket_path() {
            // The daemon has not created its socket yet; poll for it
            // without burning backoff attempts.
            Some(path) if !path.exists() => self.config.socket_poll_interval,
            _ => {
                let delay = backoff_delay(
                    self.reconnect_attempts,
                    self.config.backoff_base,
                    self.config.backoff_cap,
                );
                self.reconnect_attempts += 1;
                delay
            }
        };
        debug!(connection = %self.name, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn send_hello(&mut self) {
        self.send_message(&ClientMessage::Hello {
            version: PROTOCOL_VERSION,
        })
        .await;
    }

    async fn flush_session_queue(&mut self) {
        if self.session_in_flight {
            return;
        }
        if let Some(pending) = self.session_queue.front() {
            let msg = if self.capabilities.supports_sessions() {
                ClientMessage::NewSession {
                    options: pending.options.clone(),
                }
            } else {
                ClientMessage::NewPane {
                    options: pending.options.clone(),
                }
            };
            self.session_in_flight = true;
            self.send_message(&msg).await;
        }
    }

    async fn flush_list_queue(&mut self) {
        // One enumeration message per waiting reply; answers resolve FIFO.
        for _ in 0..self.list_queue.len() {
            let msg = self.list_message();
            self.send_message(&msg).await;
        }
    }

    fn list_message(&self) -> ClientMessage {
        if self.capabilities.supports_sessions() {
            ClientMessage::ListSessions
        } else {
            ClientMessage::ListPanes
        }
    }

    async fn flush_attach_requests(&mut self) {
        if !self.capabilities.supports_sessions() {
            for (_, waiters) in self.attach_waiters.drain() {
                for waiter in waiters {
                    let _ = waiter.send(Err(ClientError::AttachUnsupported));
                }
            }
            return;
        }

        let waiting: Vec<String> = self.attach_waiters.keys().cloned().collect();
        for session_id in waiting {
            self.send_attach(&session_id).await;
        }

        // Re-attach surviving panes so their sessions resume after a
        // reconnect; their sync state resets when the ack arrives.
        let surviving: Vec<String> = self
            .panes
            .values()
            .filter_map(|entry| entry.session_id.clone())
            .collect();
        for session_id in surviving {
            self.send_attach(&session_id).await;
        }
    }

    /// Send `attach_session` unless one is already outstanding for this id.
    async fn send_attach(&mut self, session_id: &str) {
        if self.attach_sent.insert(session_id.to_string()) {
            self.send_message(&ClientMessage::AttachSession {
                session_id: session_id.to_string(),
            })
            .await;
        }
    }

    async fn send_message(&self, msg: &ClientMessage) {
        match protocol::encode_line(msg) {
            Ok(line) => {
                if let Err(e) = self.transport.send(&line).await {
                    // The transport reports its own death; failure handling
                    // happens when the Closed event arrives.
                    debug!(connection = %self.name, error = %e, "send failed");
                }
            }
            Err(e) => warn!(connection = %self.name, error = %e, "failed to encode message"),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state.clone();
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pane::PaneEvent;
    use crate::testutil::{fast_config, wait_for_state, welcome, FakeTransport};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_end_to_end_session_request() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request_session(SessionRequestOptions {
                    cwd: Some("/tmp".into()),
                    ..Default::default()
                })
                .await
            })
        };

        // The request kicks the handshake.
        let frames = transport.wait_frames(1).await;
        assert_eq!(frames[0], r#"{"type":"hello","version":1}"#);

        transport.inject(&welcome(&["sessions"]));
        let frames = transport.wait_frames(2).await;
        assert_eq!(frames[1], r#"{"type":"new_session","cwd":"/tmp"}"#);

        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p1".into(),
            session_id: Some("s1".into()),
        });

        let mut pane = timeout(Duration::from_secs(2), caller)
            .await
            .expect("caller timed out")
            .expect("caller panicked")
            .expect("session request failed");
        assert_eq!(pane.id(), "p1");
        assert_eq!(pane.session_id(), Some("s1"));
        assert_eq!(pane.connection_name(), "test");
        assert!(pane.take_events().is_some());
        assert!(matches!(conn.state(), ConnectionState::Ready));
    }

    #[tokio::test]
    async fn test_single_in_flight_session_request_fifo() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let mut callers = Vec::new();
        for i in 0..3 {
            let conn = conn.clone();
            callers.push(tokio::spawn(async move {
                conn.request_session(SessionRequestOptions {
                    cwd: Some(format!("/tmp/{}", i)),
                    ..Default::default()
                })
                .await
            }));
        }

        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));

        // Only the head of the queue goes out.
        let frames = transport.wait_frames(2).await;
        assert_eq!(frames[1], r#"{"type":"new_session","cwd":"/tmp/0"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.frames().len(), 2, "one creation message at a time");

        // Each ack releases the next request, in submission order.
        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p0".into(),
            session_id: None,
        });
        let frames = transport.wait_frames(3).await;
        assert_eq!(frames[2], r#"{"type":"new_session","cwd":"/tmp/1"}"#);

        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p1".into(),
            session_id: None,
        });
        let frames = transport.wait_frames(4).await;
        assert_eq!(frames[3], r#"{"type":"new_session","cwd":"/tmp/2"}"#);

        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p2".into(),
            session_id: None,
        });

        for (i, caller) in callers.into_iter().enumerate() {
            let pane = timeout(Duration::from_secs(2), caller)
                .await
                .expect("timed out")
                .expect("panicked")
                .expect("request failed");
            assert_eq!(pane.id(), format!("p{}", i), "completions in submission order");
        }
    }

    #[tokio::test]
    async fn test_duplicate_attach_sends_one_message() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.attach_session("s1").await })
        };
        let second = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.attach_session("s1").await })
        };

        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));

        let frames = transport.wait_frames(2).await;
        assert_eq!(frames[1], r#"{"type":"attach_session","session_id":"s1"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let attaches = transport
            .frames()
            .iter()
            .filter(|f| f.contains("attach_session"))
            .count();
        assert_eq!(attaches, 1, "same session id attaches once");

        transport.inject(&DaemonMessage::SessionAttached {
            session_id: "s1".into(),
            pane_id: "p9".into(),
        });

        let mut panes = Vec::new();
        for caller in [first, second] {
            panes.push(
                timeout(Duration::from_secs(2), caller)
                    .await
                    .expect("timed out")
                    .expect("panicked")
                    .expect("attach failed"),
            );
        }
        assert!(panes.iter().all(|p| p.id() == "p9"));
        // Exactly one waiter holds the event stream.
        let with_events = panes
            .iter_mut()
            .map(|p| p.take_events().is_some())
            .filter(|&has| has)
            .count();
        assert_eq!(with_events, 1);

        // The attach also requested a buffer resync.
        let frames = transport.frames();
        assert!(frames
            .iter()
            .any(|f| f == r#"{"type":"snapshot_request","pane_id":"p9"}"#));
    }

    #[tokio::test]
    async fn test_legacy_daemon_uses_pane_vocabulary() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request_session(SessionRequestOptions::default()).await })
        };

        transport.wait_frames(1).await;
        transport.inject(&welcome(&[]));

        let frames = transport.wait_frames(2).await;
        assert_eq!(frames[1], r#"{"type":"new_pane"}"#);

        transport.inject(&DaemonMessage::PaneCreated {
            pane_id: "p1".into(),
            session_id: None,
        });
        let pane = timeout(Duration::from_secs(2), caller)
            .await
            .expect("timed out")
            .expect("panicked")
            .expect("request failed");
        assert_eq!(pane.id(), "p1");

        // Attach is capability-gated.
        let err = conn.attach_session("s1").await.expect_err("must fail");
        assert_eq!(err, ClientError::AttachUnsupported);

        // Enumeration uses the legacy message too.
        let lister = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.list_sessions().await })
        };
        let frames = transport.wait_frames(3).await;
        assert_eq!(frames[2], r#"{"type":"list_panes"}"#);
        transport.inject(&DaemonMessage::Panes {
            panes: vec![SessionEntry {
                session_id: "s1".into(),
                pane_id: Some("p1".into()),
                title: None,
                cwd: None,
            }],
        });
        let entries = timeout(Duration::from_secs(2), lister)
            .await
            .expect("timed out")
            .expect("panicked")
            .expect("list failed");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_hello_resent_while_connecting() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());
        conn.connect();

        // hello_interval is 30ms; expect several resends before welcome.
        let frames = transport.wait_frames(3).await;
        assert!(frames
            .iter()
            .all(|f| f == r#"{"type":"hello","version":1}"#));

        transport.inject(&welcome(&["sessions"]));
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Ready)).await;
    }

    #[tokio::test]
    async fn test_handshake_deadline_fails_connection() {
        let (transport, events_rx) = FakeTransport::create();
        let mut config = fast_config();
        config.handshake_deadline = Duration::from_millis(80);
        let conn = Connection::spawn("test", transport.clone(), events_rx, config);
        conn.connect();

        let state = wait_for_state(&conn, |s| matches!(s, ConnectionState::Failed(_))).await;
        match state {
            ConnectionState::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::HandshakeTimeout);
            }
            other => panic!("expected failed, got {:?}", other),
        }
        // No pending work, so no reconnect: connect was called exactly once.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_queued_request_survives_reconnect() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request_session(SessionRequestOptions::default()).await })
        };

        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));
        transport.wait_frames(2).await; // new_session sent, unacknowledged

        // Transport dies before the ack; the queued request must be retried.
        transport.inject_close("daemon crashed");
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Failed(_))).await;

        // Backoff elapses, reconnect happens, handshake redone, request resent.
        let frames = transport.wait_frames(3).await;
        assert_eq!(frames[2], r#"{"type":"hello","version":1}"#);
        assert!(transport.connect_calls() >= 2);

        transport.inject(&welcome(&["sessions"]));
        let frames = transport.wait_frames(4).await;
        assert_eq!(frames[3], r#"{"type":"new_session"}"#);

        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p1".into(),
            session_id: None,
        });
        let pane = timeout(Duration::from_secs(2), caller)
            .await
            .expect("timed out")
            .expect("panicked")
            .expect("request failed");
        assert_eq!(pane.id(), "p1");
    }

    #[tokio::test]
    async fn test_connect_failure_retries_until_it_succeeds() {
        let (transport, events_rx) = FakeTransport::create();
        transport.set_fail_connect(true);
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request_session(SessionRequestOptions::default()).await })
        };

        // Each refused connect fails the connection; the queued request
        // keeps backoff-driven retries coming.
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Failed(_))).await;
        timeout(Duration::from_secs(2), async {
            while transport.connect_calls() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("retries while work is pending");

        transport.set_fail_connect(false);
        transport.wait_frames(1).await; // hello after a successful connect
        transport.inject(&welcome(&["sessions"]));
        transport.wait_frames(2).await;
        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p1".into(),
            session_id: None,
        });

        let pane = timeout(Duration::from_secs(2), caller)
            .await
            .expect("timed out")
            .expect("panicked")
            .expect("request failed");
        assert_eq!(pane.id(), "p1");
    }

    #[tokio::test]
    async fn test_no_reconnect_without_pending_work() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());
        conn.connect();

        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Ready)).await;

        transport.inject_close("idle disconnect");
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Failed(_))).await;

        // Nothing queued, no panes: the connection stays down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connect_calls(), 1);

        // The next caller operation reconnects.
        let _ = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.list_sessions().await })
        };
        timeout(Duration::from_secs(2), async {
            while transport.connect_calls() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("caller operation should trigger reconnect");
    }

    #[tokio::test]
    async fn test_pane_reattached_and_resynced_after_reconnect() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.attach_session("s1").await })
        };
        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));
        transport.wait_frames(2).await;
        transport.inject(&DaemonMessage::SessionAttached {
            session_id: "s1".into(),
            pane_id: "p1".into(),
        });
        let mut pane = timeout(Duration::from_secs(2), caller)
            .await
            .expect("timed out")
            .expect("panicked")
            .expect("attach failed");
        let mut events = pane.take_events().expect("event stream");

        // Satisfy the initial resync.
        transport.inject(&DaemonMessage::Snapshot {
            pane_id: "p1".into(),
            data: b"S1".to_vec(),
            cols: 80,
            rows: 24,
        });
        assert_eq!(
            timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out")
                .expect("pump gone"),
            PaneEvent::Snapshot {
                data: b"S1".to_vec(),
                cols: 80,
                rows: 24
            }
        );

        // The live pane keeps the connection reconnecting after failure.
        // Frames so far: hello, attach_session, snapshot_request(p1).
        transport.inject_close("daemon restarted");
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Failed(_))).await;

        let frames = transport.wait_frames(4).await; // hello (reconnect)
        assert_eq!(frames[3], r#"{"type":"hello","version":1}"#);
        transport.inject(&welcome(&["sessions"]));

        // The surviving pane is re-attached automatically.
        let frames = transport.wait_frames(5).await;
        assert_eq!(frames[4], r#"{"type":"attach_session","session_id":"s1"}"#);

        // Daemon assigns a fresh pane id on reattach.
        transport.inject(&DaemonMessage::SessionAttached {
            session_id: "s1".into(),
            pane_id: "p2".into(),
        });
        let frames = transport.wait_frames(6).await;
        assert_eq!(frames[5], r#"{"type":"snapshot_request","pane_id":"p2"}"#);

        // Output before the snapshot is parked; snapshot is delivered first.
        transport.inject(&DaemonMessage::Output {
            pane_id: "p2".into(),
            data: b"A".to_vec(),
        });
        transport.inject(&DaemonMessage::Snapshot {
            pane_id: "p2".into(),
            data: b"S2".to_vec(),
            cols: 80,
            rows: 24,
        });
        assert_eq!(
            timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out")
                .expect("pump gone"),
            PaneEvent::Snapshot {
                data: b"S2".to_vec(),
                cols: 80,
                rows: 24
            }
        );
        assert_eq!(
            timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out")
                .expect("pump gone"),
            PaneEvent::Output(b"A".to_vec())
        );
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());
        conn.connect();

        transport.wait_frames(1).await;
        transport.inject_raw("this is not json");
        transport.inject_raw(r#"{"type":"from_the_future","x":1}"#);
        transport.inject(&welcome(&["sessions"]));

        // Garbage neither kills the connection nor blocks the handshake.
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Ready)).await;
    }

    #[tokio::test]
    async fn test_daemon_error_fails_connection() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());
        conn.connect();

        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Ready)).await;

        transport.inject(&DaemonMessage::Error {
            message: "out of ptys".into(),
        });
        let state = wait_for_state(&conn, |s| matches!(s, ConnectionState::Failed(_))).await;
        match state {
            ConnectionState::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::Daemon);
                assert_eq!(failure.message, "out of ptys");
            }
            other => panic!("expected failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_input_and_resize_and_close_are_forwarded() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request_session(SessionRequestOptions::default()).await })
        };
        transport.wait_frames(1).await;
        transport.inject(&welcome(&["sessions"]));
        transport.wait_frames(2).await;
        transport.inject(&DaemonMessage::SessionCreated {
            pane_id: "p1".into(),
            session_id: None,
        });
        let pane = timeout(Duration::from_secs(2), caller)
            .await
            .expect("timed out")
            .expect("panicked")
            .expect("request failed");

        pane.send_input(b"ls\r").expect("input");
        pane.resize(120, 40).expect("resize");
        pane.close().expect("close");

        let frames = transport.wait_frames(5).await;
        assert_eq!(frames[2], r#"{"type":"input","pane_id":"p1","data":"bHMN"}"#);
        assert_eq!(
            frames[3],
            r#"{"type":"resize","pane_id":"p1","cols":120,"rows":40}"#
        );
        assert_eq!(frames[4], r#"{"type":"close_pane","pane_id":"p1"}"#);
    }

    #[tokio::test]
    async fn test_default_session_id_recorded_from_welcome() {
        let (transport, events_rx) = FakeTransport::create();
        let conn = Connection::spawn("test", transport.clone(), events_rx, fast_config());
        conn.connect();

        transport.wait_frames(1).await;
        transport.inject(&DaemonMessage::Welcome {
            capabilities: vec!["sessions".into()],
            session_id: Some("s-default".into()),
        });
        wait_for_state(&conn, |s| matches!(s, ConnectionState::Ready)).await;
        assert_eq!(conn.default_session_id().await.as_deref(), Some("s-default"));
    }

    #[test]
    fn test_backoff_delay_monotonic_and_capped() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(15);

        let mut last = Duration::ZERO;
        for attempt in 0..20 {
            let delay = backoff_delay(attempt, base, cap);
            assert!(delay >= last, "delay must be non-decreasing");
            assert!(delay <= cap, "delay must respect the cap");
            last = delay;
        }
        assert_eq!(backoff_delay(0, base, cap), base);
        assert_eq!(backoff_delay(1, base, cap), base * 2);
        assert_eq!(backoff_delay(10, base, cap), cap);
        // Far past the shift width: still capped, no overflow.
        assert_eq!(backoff_delay(40, base, cap), cap);
    }
}
