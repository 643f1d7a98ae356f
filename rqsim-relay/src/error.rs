//! Error types for the relay.
//!
//! I/O failures on a single connection never propagate past the component
//! that observes them: the ingress handler owns read failures, the broadcast
//! loop owns write failures.

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors produced by the JSON wire codec.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RelayError {
    /// Upgrade failed; the candidate connection never reaches the registry.
    #[error("Handshake failed: {0}")]
    Handshake(String),
    /// Inbound side is unusable (peer gone, malformed frame, idle deadline).
    #[error("Read failed on connection {id}: {reason}")]
    Read { id: ConnectionId, reason: String },
    /// Outbound delivery to one recipient failed.
    #[error("Write failed on connection {id}: {reason}")]
    Write { id: ConnectionId, reason: String },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub(crate) fn read(id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::Read {
            id,
            reason: reason.into(),
        }
    }

    pub(crate) fn write(id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::Write {
            id,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
