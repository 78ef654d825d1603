//! Clipboard abstraction layer
//!
//! The core consumes a [`ClipboardAdapter`] capability; platform layers
//! implement it. This module carries the content model, snapshot hashing
//! used for echo suppression, a thin `arboard`-backed adapter for the
//! shipped binary, and an in-memory mock used by tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod image;
pub mod system;
pub mod watcher;

pub use system::SystemClipboard;

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// The platform clipboard could not be read or written right now
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),

    /// The adapter cannot represent this content kind
    #[error("unsupported clipboard content: {0}")]
    Unsupported(&'static str),
}

/// One clipboard state, as read from or written to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ClipboardContent {
    Text(String),
    /// Encoded image bytes (any common format on read, PNG on write)
    Image(Vec<u8>),
    /// Absolute paths copied on this host
    Files(Vec<PathBuf>),
    Empty,
}

/// Capability implemented by platform clipboard layers.
#[async_trait]
pub trait ClipboardAdapter: Send + Sync {
    async fn read(&self) -> Result<ClipboardContent, ClipboardError>;

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError>;

    async fn write_image(&self, png: &[u8]) -> Result<(), ClipboardError>;

    async fn write_files(&self, paths: &[PathBuf]) -> Result<(), ClipboardError>;

    /// Directory where received files should land; `None` means the OS
    /// downloads directory (or the temp directory as a last resort).
    fn download_dir(&self) -> Option<PathBuf> {
        None
    }
}

/// Content kind carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Text,
    Image,
    Files,
    None,
}

/// Last observed clipboard state, reduced to a hash. Used solely for
/// echo suppression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    pub kind: SnapshotKind,
    pub content_hash: [u8; 32],
}

impl ClipboardSnapshot {
    pub fn capture(content: &ClipboardContent) -> Self {
        match content {
            ClipboardContent::Text(text) => Self::of_text(text),
            ClipboardContent::Image(bytes) => Self::of_image(bytes),
            ClipboardContent::Files(paths) => Self::of_files(paths),
            ClipboardContent::Empty => Self {
                kind: SnapshotKind::None,
                content_hash: [0u8; 32],
            },
        }
    }

    pub fn of_text(text: &str) -> Self {
        Self {
            kind: SnapshotKind::Text,
            content_hash: sha256(text.as_bytes()),
        }
    }

    pub fn of_image(bytes: &[u8]) -> Self {
        Self {
            kind: SnapshotKind::Image,
            content_hash: sha256(bytes),
        }
    }

    /// Files hash over sorted (basename, size) tuples, so path order and
    /// parent directories do not affect echo detection.
    pub fn of_files(paths: &[PathBuf]) -> Self {
        let mut entries: Vec<(String, u64)> = paths
            .iter()
            .map(|p| {
                let name = basename(p);
                let size = std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
                (name, size)
            })
            .collect();
        entries.sort();

        let mut hasher = Sha256::new();
        for (name, size) in &entries {
            hasher.update(name.as_bytes());
            hasher.update(size.to_be_bytes());
        }
        Self {
            kind: SnapshotKind::Files,
            content_hash: hasher.finalize().into(),
        }
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Basename of a path; folders are flattened throughout the system.
pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// In-memory adapter used by tests and demos.
pub struct MockClipboard {
    state: tokio::sync::Mutex<ClipboardContent>,
    writes: tokio::sync::Mutex<Vec<ClipboardContent>>,
    download_dir: Option<PathBuf>,
}

impl MockClipboard {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(ClipboardContent::Empty),
            writes: tokio::sync::Mutex::new(Vec::new()),
            download_dir: None,
        }
    }

    pub fn with_download_dir(dir: PathBuf) -> Self {
        Self {
            download_dir: Some(dir),
            ..Self::new()
        }
    }

    /// Simulate a local copy.
    pub async fn set(&self, content: ClipboardContent) {
        *self.state.lock().await = content;
    }

    /// Contents written by remote installs, oldest first.
    pub async fn writes(&self) -> Vec<ClipboardContent> {
        self.writes.lock().await.clone()
    }

    pub async fn last_write(&self) -> Option<ClipboardContent> {
        self.writes.lock().await.last().cloned()
    }
}

impl Default for MockClipboard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClipboardAdapter for MockClipboard {
    async fn read(&self) -> Result<ClipboardContent, ClipboardError> {
        Ok(self.state.lock().await.clone())
    }

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let content = ClipboardContent::Text(text.to_string());
        *self.state.lock().await = content.clone();
        self.writes.lock().await.push(content);
        Ok(())
    }

    async fn write_image(&self, png: &[u8]) -> Result<(), ClipboardError> {
        let content = ClipboardContent::Image(png.to_vec());
        *self.state.lock().await = content.clone();
        self.writes.lock().await.push(content);
        Ok(())
    }

    async fn write_files(&self, paths: &[PathBuf]) -> Result<(), ClipboardError> {
        let content = ClipboardContent::Files(paths.to_vec());
        *self.state.lock().await = content.clone();
        self.writes.lock().await.push(content);
        Ok(())
    }

    fn download_dir(&self) -> Option<PathBuf> {
        self.download_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_snapshots_track_content() {
        let a = ClipboardSnapshot::of_text("hello");
        let b = ClipboardSnapshot::of_text("hello");
        let c = ClipboardSnapshot::of_text("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn file_snapshots_ignore_order_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let x = dir.path().join("x.txt");
        let y = dir.path().join("y.txt");
        std::fs::write(&x, b"xx").unwrap();
        std::fs::write(&y, b"yyy").unwrap();

        let fwd = ClipboardSnapshot::of_files(&[x.clone(), y.clone()]);
        let rev = ClipboardSnapshot::of_files(&[y, x]);
        assert_eq!(fwd, rev);
    }

    #[test]
    fn kinds_never_collide() {
        let text = ClipboardSnapshot::of_text("data");
        let image = ClipboardSnapshot::of_image(b"data");
        // Same bytes, different kind: must not compare equal.
        assert_ne!(text, image);
    }

    #[tokio::test]
    async fn mock_records_writes() {
        let mock = MockClipboard::new();
        mock.write_text("one").await.unwrap();
        mock.write_text("two").await.unwrap();
        assert_eq!(mock.writes().await.len(), 2);
        assert_eq!(
            mock.last_write().await,
            Some(ClipboardContent::Text("two".into()))
        );
        assert_eq!(
            mock.read().await.unwrap(),
            ClipboardContent::Text("two".into())
        );
    }
}
