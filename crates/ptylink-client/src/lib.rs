//! Client for the ptylink pane daemon.
//!
//! A daemon hosts PTY ("pane") sessions; this crate maintains connections
//! to one or more daemons, multiplexes panes over them, and keeps a
//! pane's terminal buffer consistent across attach and reconnect using a
//! snapshot-plus-replay protocol that never drops or reorders output.
//!
//! # Modules
//!
//! - [`transport`]: WebSocket, unix socket, and subprocess-stdio carriers
//!   for the newline-delimited JSON protocol
//! - [`connection`]: per-daemon state machine (handshake, capabilities,
//!   reconnect backoff, request queues)
//! - [`pane`]: pane handles and per-pane output resynchronization
//! - [`manager`]: named-connection registry, request routing, and local
//!   daemon supervision
//! - [`daemon`]: local daemon spawning and liveness probing
//! - [`paths`]: endpoint and state-path resolution from the environment
//!
//! # Example
//!
//! ```no_run
//! use ptylink_client::{Manager, ManagerConfig};
//! use ptylink_core::protocol::SessionRequestOptions;
//!
//! # async fn demo() -> Result<(), ptylink_client::ClientError> {
//! let manager = Manager::new(ManagerConfig {
//!     manage_local_daemon: true,
//!     ..Default::default()
//! })
//! .await;
//!
//! let mut pane = manager
//!     .request_session(None, SessionRequestOptions {
//!         cwd: Some("/tmp".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//! let mut events = pane.take_events().expect("first consumer");
//! while let Some(event) = events.recv().await {
//!     // feed output to the renderer
//!     let _ = event;
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod pane;
pub mod paths;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use connection::{Connection, ConnectionConfig, ConnectionState, Failure, FailureKind};
pub use error::ClientError;
pub use manager::{Manager, ManagerConfig, LOCAL_CONNECTION};
pub use pane::{CursorStyle, Pane, PaneEvent};
