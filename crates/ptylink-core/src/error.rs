//! Protocol-level error types.

use thiserror::Error;

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),
}
