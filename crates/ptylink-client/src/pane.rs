//! Pane handles and per-pane output resynchronization.
//!
//! A [`Pane`] is a lightweight handle for one remote PTY session
//! multiplexed over a connection. Output is delivered as [`PaneEvent`]s
//! over a channel, pumped by a dedicated task per pane so one slow
//! consumer never stalls the connection or another pane.
//!
//! The pump also owns the attach-time resync protocol: while a requested
//! snapshot is outstanding, live output is buffered, and once the snapshot
//! arrives it is delivered first, followed by the buffered chunks in
//! arrival order. If the snapshot never comes, a bounded replay window
//! keeps capturing output for a late snapshot before giving up and
//! reverting to direct delivery.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::Command;
use crate::error::ClientError;

/// Cursor shape applied after a snapshot (DECSCUSR parameter).
///
/// Snapshot payloads do not encode the cursor shape, so the client
/// synthesizes the escape sequence to match the configured style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStyle {
    BlinkingBlock,
    SteadyBlock,
    BlinkingUnderline,
    SteadyUnderline,
    BlinkingBar,
    SteadyBar,
}

impl CursorStyle {
    /// The DECSCUSR sequence selecting this style.
    pub fn escape_sequence(self) -> &'static [u8] {
        match self {
            CursorStyle::BlinkingBlock => b"\x1b[1 q",
            CursorStyle::SteadyBlock => b"\x1b[2 q",
            CursorStyle::BlinkingUnderline => b"\x1b[3 q",
            CursorStyle::SteadyUnderline => b"\x1b[4 q",
            CursorStyle::BlinkingBar => b"\x1b[5 q",
            CursorStyle::SteadyBar => b"\x1b[6 q",
        }
    }
}

/// Events a pane delivers to its consumer, in order.
#[derive(Debug, PartialEq, Eq)]
pub enum PaneEvent {
    /// Terminal bytes for the renderer.
    Output(Vec<u8>),
    /// Full-buffer resync payload; the renderer should resize to
    /// `cols`×`rows` before feeding `data`.
    Snapshot {
        data: Vec<u8>,
        cols: u16,
        rows: u16,
    },
    Exited(i32),
    TitleChanged(String),
    CwdChanged(String),
    Notify { title: String, body: String },
}

/// Messages routed from the connection into a pane's pump task.
#[derive(Debug)]
pub(crate) enum PaneMsg {
    Output(Vec<u8>),
    Snapshot {
        data: Vec<u8>,
        cols: u16,
        rows: u16,
    },
    Exited(i32),
    Title(String),
    Cwd(String),
    Notify {
        title: String,
        body: String,
    },
    /// Reset sync state and start awaiting a fresh snapshot.
    Resync,
}

/// Timing and rendering knobs for the resync protocol.
#[derive(Debug, Clone)]
pub(crate) struct PaneSyncConfig {
    pub snapshot_timeout: Duration,
    pub replay_window: Duration,
    pub cursor_style: Option<CursorStyle>,
}

impl Default for PaneSyncConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout: Duration::from_millis(400),
            replay_window: Duration::from_secs(3),
            cursor_style: None,
        }
    }
}

/// Handle for one remote PTY session.
///
/// Owned by the caller; the owning connection keeps only the routing entry.
/// Dropping the handle does not close the remote session — call
/// [`Pane::close`] for that.
#[derive(Debug)]
pub struct Pane {
    pane_id: String,
    session_id: Option<String>,
    connection: String,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<PaneEvent>>,
}

impl Pane {
    pub(crate) fn new(
        pane_id: String,
        session_id: Option<String>,
        connection: String,
        commands: mpsc::UnboundedSender<Command>,
        events: Option<mpsc::UnboundedReceiver<PaneEvent>>,
    ) -> Self {
        Self {
            pane_id,
            session_id,
            connection,
            commands,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.pane_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Name of the connection this pane is multiplexed over.
    pub fn connection_name(&self) -> &str {
        &self.connection
    }

    /// Take the event stream. Only the first caller gets it; a pane handed
    /// to a second waiter of the same attach returns `None` here.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PaneEvent>> {
        self.events.take()
    }

    /// Send keystroke/paste bytes to the remote PTY.
    pub fn send_input(&self, data: &[u8]) -> Result<(), ClientError> {
        self.commands
            .send(Command::Input {
                pane_id: self.pane_id.clone(),
                data: data.to_vec(),
            })
            .map_err(|_| ClientError::Shutdown)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.commands
            .send(Command::Resize {
                pane_id: self.pane_id.clone(),
                cols,
                rows,
            })
            .map_err(|_| ClientError::Shutdown)
    }

    /// Close the remote session explicitly.
    pub fn close(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::ClosePane {
                pane_id: self.pane_id.clone(),
            })
            .map_err(|_| ClientError::Shutdown)
    }
}

/// Spawn the pump task for one pane.
///
/// Returns the sender the connection routes pane messages into, the event
/// receiver for the caller, and the task handle.
pub(crate) fn spawn_pump(
    pane_id: String,
    config: PaneSyncConfig,
    start_in_resync: bool,
) -> (
    mpsc::UnboundedSender<PaneMsg>,
    mpsc::UnboundedReceiver<PaneEvent>,
    JoinHandle<()>,
) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let mut pump = PanePump {
        pane_id,
        config,
        phase: Phase::Live,
        processed_output: false,
        events: event_tx,
        messages: msg_rx,
    };
    if start_in_resync {
        pump.start_resync();
    }
    let task = tokio::spawn(pump.run());

    (msg_tx, event_rx, task)
}

/// Where the pump is in the snapshot resync protocol.
enum Phase {
    /// Snapshot requested; live output parks in `pending` until it
    /// arrives or the timeout fires.
    AwaitingSnapshot {
        pending: Vec<Vec<u8>>,
        deadline: Instant,
    },
    /// Snapshot timed out; output is captured for a late snapshot until
    /// the window closes.
    Replay {
        buffer: Vec<Vec<u8>>,
        deadline: Instant,
    },
    /// Direct delivery.
    Live,
}

struct PanePump {
    pane_id: String,
    config: PaneSyncConfig,
    phase: Phase,
    /// True once any output or snapshot has reached the renderer. A
    /// snapshot arriving after this would paint stale content above live
    /// content, so only its trailing cursor-style sequence is applied.
    processed_output: bool,
    events: mpsc::UnboundedSender<PaneEvent>,
    messages: mpsc::UnboundedReceiver<PaneMsg>,
}

impl PanePump {
    async fn run(mut self) {
        loop {
            let deadline = self.phase_deadline();
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = self.messages.recv() => match msg {
                    Some(msg) => {
                        if !self.handle(msg) {
                            return;
                        }
                    }
                    // Connection dropped the routing entry; nothing more will come.
                    None => return,
                },
                _ = timer => self.on_deadline(),
            }
        }
    }

    fn phase_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::AwaitingSnapshot { deadline, .. } | Phase::Replay { deadline, .. } => {
                Some(*deadline)
            }
            Phase::Live => None,
        }
    }

    /// Process one routed message; returns false once the pane is done.
    fn handle(&mut self, msg: PaneMsg) -> bool {
        match msg {
            PaneMsg::Output(data) => match &mut self.phase {
                Phase::AwaitingSnapshot { pending, .. } => pending.push(data),
                Phase::Replay { buffer, .. } => buffer.push(data),
                Phase::Live => {
                    self.processed_output = true;
                    self.emit(PaneEvent::Output(data));
                }
            },
            PaneMsg::Snapshot { data, cols, rows } => self.handle_snapshot(data, cols, rows),
            PaneMsg::Title(title) => self.emit(PaneEvent::TitleChanged(title)),
            PaneMsg::Cwd(cwd) => self.emit(PaneEvent::CwdChanged(cwd)),
            PaneMsg::Notify { title, body } => self.emit(PaneEvent::Notify { title, body }),
            PaneMsg::Resync => self.start_resync(),
            PaneMsg::Exited(code) => {
                self.emit(PaneEvent::Exited(code));
                return false;
            }
        }
        true
    }

    fn start_resync(&mut self) {
        self.phase = Phase::AwaitingSnapshot {
            pending: Vec::new(),
            deadline: Instant::now() + self.config.snapshot_timeout,
        };
    }

    fn handle_snapshot(&mut self, data: Vec<u8>, cols: u16, rows: u16) {
        match std::mem::replace(&mut self.phase, Phase::Live) {
            Phase::AwaitingSnapshot { pending, .. } => {
                self.deliver_snapshot(data, cols, rows, pending);
            }
            Phase::Replay { buffer, .. } => {
                // Late snapshot inside the replay window: snapshot first,
                // then everything captured while waiting for it.
                self.deliver_snapshot(data, cols, rows, buffer);
            }
            Phase::Live => {
                if self.processed_output {
                    debug!(pane = %self.pane_id, "suppressing stale snapshot");
                    if let Some(seq) = trailing_cursor_style(&data) {
                        self.emit(PaneEvent::Output(seq));
                    }
                } else {
                    self.deliver_snapshot(data, cols, rows, Vec::new());
                }
            }
        }
    }

    fn deliver_snapshot(&mut self, data: Vec<u8>, cols: u16, rows: u16, buffered: Vec<Vec<u8>>) {
        self.emit(PaneEvent::Snapshot { data, cols, rows });
        for chunk in buffered {
            self.emit(PaneEvent::Output(chunk));
        }
        if let Some(style) = self.config.cursor_style {
            self.emit(PaneEvent::Output(style.escape_sequence().to_vec()));
        }
        self.processed_output = true;
    }

    fn on_deadline(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Live) {
            Phase::AwaitingSnapshot { pending, .. } => {
                debug!(pane = %self.pane_id, "snapshot timed out; opening replay window");
                self.phase = Phase::Replay {
                    buffer: pending,
                    deadline: Instant::now() + self.config.replay_window,
                };
            }
            Phase::Replay { buffer, .. } => {
                if !buffer.is_empty() {
                    debug!(
                        pane = %self.pane_id,
                        chunks = buffer.len(),
                        "replay window expired without a snapshot; discarding buffered output"
                    );
                }
            }
            Phase::Live => {}
        }
    }

    fn emit(&mut self, event: PaneEvent) {
        // The consumer dropping its receiver just means nobody is watching.
        let _ = self.events.send(event);
    }
}

/// Pull the last cursor-style (DECSCUSR) escape out of a snapshot payload.
fn trailing_cursor_style(data: &[u8]) -> Option<Vec<u8>> {
    static PATTERN: OnceLock<regex::bytes::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::bytes::Regex::new(r"\x1b\[[0-6] q").expect("hard-coded pattern compiles")
    });
    re.find_iter(data).last().map(|m| m.as_bytes().to_vec())
}
