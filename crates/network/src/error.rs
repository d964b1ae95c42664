//! Network error types for the coordinator transport layer.

use std::io;
use thiserror::Error;
use tss_types::ParticipantId;

/// Errors that can occur during network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No endpoint attached for the destination participant.
    #[error("peer {id} not connected")]
    NotConnected { id: ParticipantId },

    /// No endpoint attached for the destination client.
    #[error("client {client_id} not connected")]
    ClientNotConnected { client_id: String },

    /// The endpoint entered its terminal Closed state.
    #[error("endpoint {label} closed")]
    Closed { label: String },

    /// Listener bind failed.
    #[error("failed to bind listener on {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Message encoding/decoding error.
    #[error("message codec error: {0}")]
    Codec(String),

    /// The peer never presented a usable hello frame.
    #[error("handshake with {address} failed: {reason}")]
    HandshakeFailed { address: String, reason: String },
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
