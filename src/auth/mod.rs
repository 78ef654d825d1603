//! Pairing identity and key storage
//!
//! A yank installation is paired with exactly one peer. The pairing record
//! (device identities plus the 32-byte shared secret established during
//! pairing) is persisted at `~/.yank/pairing.json` with 0600 permissions.
//! Writes go through an atomic temp-then-rename and are serialized by an
//! in-process mutex; the CLI surface only ever reads.

pub mod pairing;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{atomic_write, Config};

/// Authentication and pairing errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// No pairing record exists
    #[error("not paired with any device")]
    NotPaired,

    /// PIN exchange failed
    #[error("pairing failed: {0}")]
    PairingFailed(String),

    /// Challenge-response handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A peer presented an identity other than the paired one
    #[error("peer identity mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: String, actual: String },

    /// AEAD seal/open failure; treated as fatal for the connection
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// Stored record is malformed
    #[error("malformed pairing record: {0}")]
    Record(String),

    /// IO error accessing the pairing store
    #[error("pairing store error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error in the pairing store
    #[error("pairing store error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The 32-byte secret shared by the two paired devices.
///
/// Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| AuthError::Record(format!("bad shared secret encoding: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| AuthError::Record("shared secret is not 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Identity of this device and its paired peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRecord {
    /// Our stable opaque identifier, advertised over mDNS
    pub device_id: String,
    /// Our human-readable name
    pub device_name: String,
    /// The paired peer's identifier
    pub peer_device_id: String,
    /// The paired peer's human-readable name
    pub peer_name: String,
    /// Base64-encoded 32-byte shared secret
    pub shared_secret_b64: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PairingRecord {
    pub fn shared_secret(&self) -> Result<SharedSecret, AuthError> {
        SharedSecret::from_base64(&self.shared_secret_b64)
    }
}

/// Generate a fresh stable device identifier (8 random bytes, hex).
pub fn new_device_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Best-effort human-readable name for this host.
pub fn local_device_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "yank-device".to_string());
    format!("{} ({})", host, std::env::consts::OS)
}

/// On-disk store for the single pairing record.
pub struct PairingStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PairingStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Default location: `~/.yank/pairing.json`.
    pub fn default_path() -> PathBuf {
        Config::data_dir().join("pairing.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the pairing record, `None` when unpaired.
    pub fn load(&self) -> Result<Option<PairingRecord>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let record: PairingRecord = serde_json::from_str(&raw)?;
        Ok(Some(record))
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.load(), Ok(Some(_)))
    }

    /// Persist `record`, replacing any existing pairing.
    pub fn save(&self, record: &PairingRecord) -> Result<(), AuthError> {
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| AuthError::Record("pairing store lock poisoned".into()))?;
        let mut raw = serde_json::to_vec_pretty(record)?;
        raw.push(b'\n');
        atomic_write(&self.path, &raw)?;
        restrict_permissions(&self.path)?;
        drop(guard);
        Ok(())
    }

    /// Erase the pairing record. A no-op when already unpaired.
    pub fn clear(&self) -> Result<(), AuthError> {
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| AuthError::Record("pairing store lock poisoned".into()))?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        drop(guard);
        Ok(())
    }

    /// Refresh `last_seen` after a successful handshake.
    pub fn touch_last_seen(&self) -> Result<(), AuthError> {
        if let Some(mut record) = self.load()? {
            record.last_seen = Some(Utc::now());
            self.save(&record)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
