//! Authenticated transport layer
//!
//! TCP connect/accept, the HELLO/CHALLENGE/RESPONSE/OK handshake, and
//! AEAD sealing of every subsequent frame. Exactly one authenticated
//! connection is active at a time; the sync agent owns that policy, this
//! module owns the mechanics.

use std::time::Duration;
use thiserror::Error;

pub mod connection;
pub mod frame;

pub use connection::{Connection, ConnectionReader, ConnectionSender};
pub use frame::{
    AnnounceHeader, CancelHeader, ChunkHeader, CompleteHeader, FilesInlineHeader, HelloHeader,
    ImageHeader, Message, ProtocolError, RequestHeader, TransferErrorCode, TransferErrorHeader,
    MAX_FRAME_LEN,
};

/// Time allowed for a full handshake before the connection is abandoned.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between outbound heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Frames-silent window after which the connection counts as dead
/// (three missed heartbeats).
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

/// Reconnect backoff schedule in seconds; the last entry repeats.
pub const BACKOFF_SCHEDULE: &[u64] = &[1, 2, 4, 8, 15, 30];

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed frame or unexpected message; terminates the connection
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake or AEAD failure; terminates the connection
    #[error("authentication error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// TCP connect failure
    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    /// The peer went away mid-session
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Clean close by the peer
    #[error("connection closed by peer")]
    Closed,

    /// The handshake did not complete in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
