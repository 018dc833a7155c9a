//! Byte-stream carriers for the wire protocol.
//!
//! A transport turns some underlying byte stream into discrete
//! newline-delimited JSON messages and reports them over an event channel
//! handed to it at construction. Three variants:
//!
//! - [`ws::WebSocketTransport`]: persistent WebSocket; frames arrive whole,
//!   no line reassembly needed
//! - [`unix::UnixTransport`]: local domain socket with explicit line
//!   reassembly
//! - [`stdio::StdioTransport`]: a spawned subprocess's stdin/stdout; the
//!   transport owns the child process
//!
//! All variants serialize concurrent sends through a single writer task so
//! frames never interleave, and guarantee that a failed write eventually
//! surfaces as [`TransportEvent::Closed`] rather than disappearing.

pub mod framing;
pub mod stdio;
pub mod unix;
pub mod ws;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest accepted inbound frame. Snapshots of a large scrollback are the
/// biggest legitimate payload; anything past this is a broken peer.
pub(crate) const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Events a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete framed message (without the trailing newline).
    Message(String),
    /// The stream ended, gracefully or not. Fires at most once per
    /// successful `connect`.
    Closed(String),
}

/// Errors surfaced directly from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// A framed byte-stream carrier.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin establishing the underlying stream. Calling this while already
    /// connected is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Enqueue one framed message for sending.
    async fn send(&self, line: &str) -> Result<(), TransportError>;

    /// Tear down the stream. Safe to call repeatedly.
    async fn close(&self);

    /// Socket file backing the unix variant, if any. The connection uses
    /// this to poll for a daemon that has not created its socket yet.
    fn local_socket_path(&self) -> Option<&Path> {
        None
    }
}

/// Per-connect guard that delivers `Closed` exactly once.
///
/// Reader, writer, and explicit close all race to report termination; the
/// first one wins and the rest are no-ops.
pub(crate) struct LinkGuard {
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl LinkGuard {
    pub(crate) fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            closed: AtomicBool::new(false),
        })
    }

    /// Forward one inbound message, unless the link already closed.
    pub(crate) fn message(&self, text: String) {
        if !self.is_closed() {
            let _ = self.events.send(TransportEvent::Message(text));
        }
    }

    /// Report termination. Only the first call emits the event.
    pub(crate) fn close(&self, reason: impl Into<String>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed(reason.into()));
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
