//! Status and progress surface
//!
//! The agent reports its life through an [`EventSink`]: state changes,
//! transfer announcements, progress with smoothed speed and ETA,
//! completions, and user-visible errors. The CLI installs a
//! tracing-backed sink; tests install channel sinks.

use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::transfer::chunked::format_bytes;
use crate::transfer::FileMetadata;

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unpaired,
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Degraded,
    Closed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Unpaired => "unpaired",
            AgentState::Idle => "idle",
            AgentState::Connecting => "connecting",
            AgentState::Authenticating => "authenticating",
            AgentState::Connected => "connected",
            AgentState::Degraded => "degraded",
            AgentState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Coarse error categories surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Auth,
    ConnectionLost,
    ChecksumMismatch,
    ExpiredOrUnknownTransfer,
    ClipboardUnavailable,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Auth => "authentication error",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::ExpiredOrUnknownTransfer => "transfer expired or unknown",
            ErrorKind::ClipboardUnavailable => "clipboard unavailable",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Callbacks fired from the agent's event context. Implementations must
/// be cheap and non-blocking.
pub trait EventSink: Send + Sync {
    fn on_state(&self, _state: AgentState) {}

    fn on_announced(&self, _transfer_id: &str, _files: &[FileMetadata]) {}

    fn on_progress(
        &self,
        _transfer_id: &str,
        _bytes_done: u64,
        _bytes_total: u64,
        _speed_bps: f64,
        _eta_s: f64,
    ) {
    }

    fn on_complete(&self, _transfer_id: &str, _paths: &[PathBuf]) {}

    fn on_error(&self, _kind: ErrorKind, _detail: &str) {}
}

/// Sink that narrates agent life into the log stream.
pub struct LogSink;

impl EventSink for LogSink {
    fn on_state(&self, state: AgentState) {
        info!(%state, "agent state changed");
    }

    fn on_announced(&self, transfer_id: &str, files: &[FileMetadata]) {
        let total: u64 = files.iter().map(|f| f.size).sum();
        info!(
            transfer_id,
            files = files.len(),
            total = %format_bytes(total),
            "peer announced files"
        );
    }

    fn on_progress(
        &self,
        transfer_id: &str,
        bytes_done: u64,
        bytes_total: u64,
        speed_bps: f64,
        eta_s: f64,
    ) {
        info!(
            transfer_id,
            done = %format_bytes(bytes_done),
            total = %format_bytes(bytes_total),
            speed = %format!("{}/s", format_bytes(speed_bps as u64)),
            eta = %format!("{eta_s:.0}s"),
            "transfer progress"
        );
    }

    fn on_complete(&self, transfer_id: &str, paths: &[PathBuf]) {
        info!(transfer_id, files = paths.len(), "transfer complete");
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        match kind {
            ErrorKind::ConnectionLost | ErrorKind::ClipboardUnavailable => {
                warn!("{kind}: {detail}")
            }
            _ => error!("{kind}: {detail}"),
        }
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {}
