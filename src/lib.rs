//! # Yank
//!
//! LAN clipboard synchronization between two paired devices.
//!
//! On one host a user copies; on the other, paste yields the same content.
//! Text, images, and small file sets ship inline over a single
//! authenticated, encrypted TCP connection; large files are announced by
//! metadata only and streamed in chunks on demand.

pub mod auth;
pub mod cli;
pub mod clipboard;
pub mod config;
pub mod discovery;
pub mod ignore;
pub mod sync;
pub mod transfer;
pub mod transport;

pub use config::Config;

/// Result type alias for yank operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for yank operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pairing or handshake failure
    #[error("authentication error: {0}")]
    Auth(#[from] auth::AuthError),

    /// Configuration load/save/validation failure
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard adapter failure
    #[error("clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Wire protocol or connection failure
    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Transfer registry or chunked I/O failure
    #[error("transfer error: {0}")]
    Transfer(#[from] transfer::TransferError),

    /// Peer discovery failure
    #[error("discovery error: {0}")]
    Discovery(#[from] discovery::DiscoveryError),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything that should never happen
    #[error("internal error: {0}")]
    Internal(String),
}

/// Library version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
