//! Wire protocol between the client and the pane daemon.
//!
//! Messages are newline-delimited JSON objects, one per line, each with a
//! required `type` field. Binary payloads (`input`, `output`, `snapshot`)
//! travel as base64 strings. The `hello`/`welcome` exchange establishes the
//! protocol version and the capability set; daemons that advertise the
//! [`CAP_SESSIONS`] token speak the session-oriented vocabulary
//! (`new_session`, `list_sessions`, `attach_session`), older daemons the
//! pane-oriented one (`new_pane`, `list_panes`).

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Protocol version carried by `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability token: the daemon groups panes into named sessions that can
/// be enumerated and re-attached after the client goes away.
pub const CAP_SESSIONS: &str = "sessions";

/// The capability set advertised by a daemon in `welcome`.
///
/// Empty until the handshake completes; reset to empty on reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(Vec<String>);

impl Capabilities {
    pub fn new(tokens: Vec<String>) -> Self {
        Self(tokens)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.iter().any(|t| t == token)
    }

    /// Whether the daemon speaks the session-oriented vocabulary.
    pub fn supports_sessions(&self) -> bool {
        self.contains(CAP_SESSIONS)
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }
}

/// Options for creating a new PTY session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequestOptions {
    /// Working directory for the spawned shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// TERM value to export into the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// One entry in a `sessions`/`panes` enumeration reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Messages sent from the client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Initiate the handshake.
    Hello { version: u32 },
    /// Create a PTY session (session-capable daemons).
    NewSession {
        #[serde(flatten)]
        options: SessionRequestOptions,
    },
    /// Create a PTY session (legacy pane-oriented daemons).
    NewPane {
        #[serde(flatten)]
        options: SessionRequestOptions,
    },
    /// Attach to an existing session. Requires [`CAP_SESSIONS`].
    AttachSession { session_id: String },
    ListSessions,
    ListPanes,
    /// Keystroke/paste bytes for one pane.
    Input {
        pane_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Resize {
        pane_id: String,
        cols: u16,
        rows: u16,
    },
    /// Ask for a full-buffer resync of one pane.
    SnapshotRequest { pane_id: String },
    ClosePane { pane_id: String },
}

/// Messages sent from the daemon to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake complete.
    Welcome {
        #[serde(default)]
        capabilities: Vec<String>,
        /// Default session the daemon suggests attaching to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Mid-session capability update; replaces the advertised set.
    Capabilities { capabilities: Vec<String> },
    /// Acknowledges `new_session`.
    SessionCreated {
        pane_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Acknowledges `new_pane`.
    PaneCreated {
        pane_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Acknowledges `attach_session`.
    SessionAttached { session_id: String, pane_id: String },
    Sessions { sessions: Vec<SessionEntry> },
    Panes { panes: Vec<SessionEntry> },
    /// Live PTY bytes for one pane.
    Output {
        pane_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// Full-buffer resync payload.
    Snapshot {
        pane_id: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
        cols: u16,
        rows: u16,
    },
    TitleUpdate { pane_id: String, title: String },
    CwdUpdate { pane_id: String, cwd: String },
    /// Desktop-notification passthrough from a program inside the pane.
    Notify {
        pane_id: String,
        title: String,
        body: String,
    },
    PaneExited { pane_id: String, exit_code: i32 },
    /// Fatal connection-level error.
    Error { message: String },
}

/// Serialize one message as a single wire line (newline excluded; the
/// transport owns the terminator).
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Encode)
}

/// Parse one wire line. The caller drops malformed lines.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(ProtocolError::Decode)
}

/// Base64 (standard alphabet) representation for binary payload fields.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
