//! Client-facing error types.

use thiserror::Error;

/// Errors surfaced to callers of the connection, pane, and manager APIs.
///
/// Transport and daemon failures are not represented here: those are
/// retried internally (queued work survives a reconnect) and show up as
/// connection state, not as request errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No connection is registered under the requested name.
    #[error("unknown connection '{0}'")]
    ConnectionNotFound(String),
    /// The daemon does not advertise the `sessions` capability.
    #[error("daemon does not support attaching to sessions")]
    AttachUnsupported,
    /// The connection (or manager) behind this handle has shut down.
    #[error("connection shut down")]
    Shutdown,
    /// Local daemon support is disabled or the daemon could not be started.
    #[error("local daemon unavailable: {0}")]
    DaemonUnavailable(String),
}
