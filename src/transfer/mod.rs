//! Transfer registry
//!
//! Two maps keyed by transfer id: `announced` holds sender-side records
//! (with source paths) and `pending` holds receiver-side records. A
//! janitor sweeps expired entries every 30 seconds; records that are
//! actively TRANSFERRING get their deadline extended by one TTL instead
//! of being dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

pub mod chunked;

/// How often the janitor runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Finalized content does not match the announced checksum
    #[error("checksum mismatch for {name}")]
    ChecksumMismatch { name: String },

    /// The id is unknown or past its deadline
    #[error("transfer {0} is expired or unknown")]
    ExpiredOrUnknown(String),

    /// Cancelled locally or by the peer
    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    /// Outbound content exceeds a configured limit
    #[error("size limit exceeded: {size} bytes > {limit} bytes")]
    SizeLimit { size: u64, limit: u64 },

    /// IO error during chunked reads or writes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata for one file within a transfer. Folders are flattened, so
/// `name` is always a basename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// SHA-256 over the full content, hex (64 chars)
    pub checksum: String,
    #[serde(default)]
    pub mime_hint: Option<String>,
}

/// Lifecycle of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Complete,
    Failed,
    Expired,
    Canceled,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Transferring => "TRANSFERRING",
            TransferStatus::Complete => "COMPLETE",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Expired => "EXPIRED",
            TransferStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// One announced or pending transfer.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub files: Vec<FileMetadata>,
    /// Sender side only: absolute source paths, one per file
    pub source_paths: Vec<PathBuf>,
    pub announced_at: Instant,
    pub expires_at: Instant,
    pub status: TransferStatus,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Receiver side: where finished files land
    pub dest_dir: Option<PathBuf>,
    /// Receiver side: retry attempts consumed for transient errors
    pub attempts: u32,
}

impl TransferRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Generate a fresh 16-byte transfer id, hex-encoded.
pub fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Default)]
struct Maps {
    announced: HashMap<String, TransferRecord>,
    pending: HashMap<String, TransferRecord>,
}

/// Which side of a transfer a record lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Announced,
    Pending,
}

/// Mutex-guarded registry of announced and pending transfers.
///
/// No lock is ever held across file or network I/O: operations clone
/// records out and write scalar updates back.
pub struct TransferRegistry {
    maps: Mutex<Maps>,
    ttl: Duration,
}

impl TransferRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sender side: remember what we offered so FILE_REQUEST can be served.
    pub fn register_announced(
        &self,
        transfer_id: &str,
        files: Vec<FileMetadata>,
        source_paths: Vec<PathBuf>,
    ) -> TransferRecord {
        let record = self.build_record(transfer_id, files, source_paths, None, self.ttl);
        let mut maps = self.lock();
        maps.announced.insert(transfer_id.to_string(), record.clone());
        info!(transfer_id, files = record.files.len(), "registered announced transfer");
        record
    }

    /// Receiver side: remember what the peer offered.
    pub fn register_pending(
        &self,
        transfer_id: &str,
        files: Vec<FileMetadata>,
        ttl: Duration,
        dest_dir: PathBuf,
    ) -> TransferRecord {
        let record = self.build_record(transfer_id, files, Vec::new(), Some(dest_dir), ttl);
        let mut maps = self.lock();
        maps.pending.insert(transfer_id.to_string(), record.clone());
        info!(
            transfer_id,
            bytes = record.bytes_total,
            "registered pending transfer"
        );
        record
    }

    fn build_record(
        &self,
        transfer_id: &str,
        files: Vec<FileMetadata>,
        source_paths: Vec<PathBuf>,
        dest_dir: Option<PathBuf>,
        ttl: Duration,
    ) -> TransferRecord {
        let now = Instant::now();
        let bytes_total = files.iter().map(|f| f.size).sum();
        TransferRecord {
            transfer_id: transfer_id.to_string(),
            files,
            source_paths,
            announced_at: now,
            expires_at: now + ttl,
            status: TransferStatus::Pending,
            bytes_done: 0,
            bytes_total,
            dest_dir,
            attempts: 0,
        }
    }

    pub fn get(&self, side: Side, transfer_id: &str) -> Option<TransferRecord> {
        let maps = self.lock();
        self.map_of(&maps, side).get(transfer_id).cloned()
    }

    fn map_of<'a>(&self, maps: &'a Maps, side: Side) -> &'a HashMap<String, TransferRecord> {
        match side {
            Side::Announced => &maps.announced,
            Side::Pending => &maps.pending,
        }
    }

    fn map_of_mut<'a>(
        &self,
        maps: &'a mut Maps,
        side: Side,
    ) -> &'a mut HashMap<String, TransferRecord> {
        match side {
            Side::Announced => &mut maps.announced,
            Side::Pending => &mut maps.pending,
        }
    }

    /// Bump `bytes_done`; flips the record to TRANSFERRING. Returns the
    /// updated `(bytes_done, bytes_total)` when the record exists.
    pub fn update_progress(
        &self,
        side: Side,
        transfer_id: &str,
        bytes_done: u64,
    ) -> Option<(u64, u64)> {
        let mut maps = self.lock();
        let record = self.map_of_mut(&mut maps, side).get_mut(transfer_id)?;
        record.bytes_done = bytes_done;
        record.status = TransferStatus::Transferring;
        Some((record.bytes_done, record.bytes_total))
    }

    /// Set a terminal or transitional status.
    pub fn mark(&self, side: Side, transfer_id: &str, status: TransferStatus) {
        let mut maps = self.lock();
        if let Some(record) = self.map_of_mut(&mut maps, side).get_mut(transfer_id) {
            record.status = status;
        }
    }

    /// Count a transient-failure retry; returns the attempt number.
    pub fn bump_attempts(&self, transfer_id: &str) -> Option<u32> {
        let mut maps = self.lock();
        let record = maps.pending.get_mut(transfer_id)?;
        record.attempts += 1;
        Some(record.attempts)
    }

    pub fn remove(&self, side: Side, transfer_id: &str) -> Option<TransferRecord> {
        let mut maps = self.lock();
        self.map_of_mut(&mut maps, side).remove(transfer_id)
    }

    /// Mark every in-flight record FAILED (connection loss). Returns the
    /// affected ids.
    pub fn fail_in_flight(&self) -> Vec<String> {
        let mut maps = self.lock();
        let maps = &mut *maps;
        let mut failed = Vec::new();
        for record in maps.announced.values_mut().chain(maps.pending.values_mut()) {
            if record.status == TransferStatus::Transferring {
                record.status = TransferStatus::Failed;
                failed.push(record.transfer_id.clone());
            }
        }
        failed
    }

    /// Drop expired records. A record that is actively TRANSFERRING has
    /// its deadline extended by one TTL instead.
    pub fn sweep_expired(&self) -> Vec<TransferRecord> {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut swept = Vec::new();

        let mut maps = self.lock();
        let maps = &mut *maps;
        for map in [&mut maps.announced, &mut maps.pending] {
            let expired_ids: Vec<String> = map
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.transfer_id.clone())
                .collect();
            for id in expired_ids {
                let Some(record) = map.get_mut(&id) else {
                    continue;
                };
                if record.status == TransferStatus::Transferring {
                    record.expires_at = now + ttl;
                    continue;
                }
                let Some(mut record) = map.remove(&id) else {
                    continue;
                };
                record.status = TransferStatus::Expired;
                warn!(transfer_id = %record.transfer_id, "transfer expired");
                swept.push(record);
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(sizes: &[u64]) -> Vec<FileMetadata> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| FileMetadata {
                name: format!("file{i}.bin"),
                size: *size,
                checksum: "00".repeat(32),
                mime_hint: None,
            })
            .collect()
    }

    #[test]
    fn transfer_ids_are_unique_and_hex() {
        let a = new_transfer_id();
        let b = new_transfer_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(hex::decode(&a).is_ok());
    }

    #[test]
    fn register_and_progress() {
        let registry = TransferRegistry::new(Duration::from_secs(300));
        let id = new_transfer_id();
        let record = registry.register_announced(
            &id,
            files(&[1000, 2000]),
            vec![PathBuf::from("/a"), PathBuf::from("/b")],
        );
        assert_eq!(record.bytes_total, 3000);
        assert_eq!(record.status, TransferStatus::Pending);

        let (done, total) = registry.update_progress(Side::Announced, &id, 1500).unwrap();
        assert_eq!((done, total), (1500, 3000));
        assert_eq!(
            registry.get(Side::Announced, &id).unwrap().status,
            TransferStatus::Transferring
        );
    }

    #[test]
    fn sides_are_independent() {
        let registry = TransferRegistry::new(Duration::from_secs(300));
        let id = new_transfer_id();
        registry.register_pending(
            &id,
            files(&[10]),
            Duration::from_secs(300),
            PathBuf::from("/dst"),
        );
        assert!(registry.get(Side::Pending, &id).is_some());
        assert!(registry.get(Side::Announced, &id).is_none());
    }

    #[test]
    fn sweep_removes_expired_but_extends_transferring() {
        let registry = TransferRegistry::new(Duration::from_millis(0));
        let stale = new_transfer_id();
        let busy = new_transfer_id();
        registry.register_announced(&stale, files(&[5]), vec![PathBuf::from("/x")]);
        registry.register_announced(&busy, files(&[5]), vec![PathBuf::from("/y")]);
        registry.mark(Side::Announced, &busy, TransferStatus::Transferring);

        std::thread::sleep(Duration::from_millis(5));
        let swept = registry.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].transfer_id, stale);
        assert_eq!(swept[0].status, TransferStatus::Expired);

        // The busy record keeps getting deadline extensions while it is
        // TRANSFERRING, and is swept once it stops being active.
        assert!(registry.get(Side::Announced, &busy).is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.sweep_expired().is_empty());
        assert!(registry.get(Side::Announced, &busy).is_some());

        registry.mark(Side::Announced, &busy, TransferStatus::Failed);
        std::thread::sleep(Duration::from_millis(5));
        let swept = registry.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].transfer_id, busy);
    }

    #[test]
    fn fail_in_flight_touches_only_transferring() {
        let registry = TransferRegistry::new(Duration::from_secs(300));
        let moving = new_transfer_id();
        let idle = new_transfer_id();
        registry.register_pending(
            &moving,
            files(&[10]),
            Duration::from_secs(300),
            PathBuf::from("/d"),
        );
        registry.register_pending(
            &idle,
            files(&[10]),
            Duration::from_secs(300),
            PathBuf::from("/d"),
        );
        registry.update_progress(Side::Pending, &moving, 5);

        let failed = registry.fail_in_flight();
        assert_eq!(failed, vec![moving.clone()]);
        assert_eq!(
            registry.get(Side::Pending, &moving).unwrap().status,
            TransferStatus::Failed
        );
        assert_eq!(
            registry.get(Side::Pending, &idle).unwrap().status,
            TransferStatus::Pending
        );
    }

    #[test]
    fn expiry_invariant_holds() {
        let registry = TransferRegistry::new(Duration::from_secs(300));
        let id = new_transfer_id();
        let record = registry.register_announced(&id, files(&[1]), vec![PathBuf::from("/z")]);
        assert!(record.announced_at <= record.expires_at);
    }
}
