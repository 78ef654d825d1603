//! Clipboard change detection
//!
//! Polls the adapter, suppresses echoes of remotely installed content,
//! and classifies each genuine change for outbound dispatch. A change is
//! emitted only when its hash differs from the last emitted snapshot and
//! from every active echo-mask entry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use super::image::{normalize, NormalizedImage};
use super::{ClipboardAdapter, ClipboardContent, ClipboardError, ClipboardSnapshot};
use crate::config::Config;

/// How long a remote install suppresses re-sending the same content.
pub const ECHO_MASK_TTL: Duration = Duration::from_secs(3);

const READ_RETRIES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A classified clipboard change, ready for outbound dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ClipboardChange {
    Text(String),
    Image(NormalizedImage),
    /// Total size below the lazy threshold; ships inline
    InlineFiles(Vec<PathBuf>),
    /// Total size at or above the lazy threshold; announce-then-request
    LargeFiles(Vec<PathBuf>),
}

/// Short-lived hashes of content installed by the remote peer.
#[derive(Clone)]
pub struct EchoMask {
    inner: Arc<Mutex<Vec<(ClipboardSnapshot, Instant)>>>,
    ttl: Duration,
}

impl EchoMask {
    pub fn new() -> Self {
        Self::with_ttl(ECHO_MASK_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            ttl,
        }
    }

    /// Record a remote install; the watcher must not send it back.
    pub async fn install(&self, snapshot: ClipboardSnapshot) {
        let mut entries = self.inner.lock().await;
        let now = Instant::now();
        entries.retain(|(_, at)| now.duration_since(*at) < self.ttl);
        entries.push((snapshot, now));
    }

    pub async fn matches(&self, snapshot: &ClipboardSnapshot) -> bool {
        let mut entries = self.inner.lock().await;
        let now = Instant::now();
        entries.retain(|(_, at)| now.duration_since(*at) < self.ttl);
        entries.iter().any(|(masked, _)| masked == snapshot)
    }
}

impl Default for EchoMask {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the polling loop. Classified changes arrive on the returned
/// channel until the stop signal fires or the receiver is dropped.
pub fn spawn(
    adapter: Arc<dyn ClipboardAdapter>,
    config: Arc<Config>,
    mask: EchoMask,
    mut stop: watch::Receiver<bool>,
) -> mpsc::Receiver<ClipboardChange> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_emitted: Option<ClipboardSnapshot> = None;

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            let content = match read_with_retry(adapter.as_ref()).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("clipboard read failed: {e}");
                    continue;
                }
            };
            if matches!(content, ClipboardContent::Empty) {
                continue;
            }
            if !kind_enabled(&content, &config) {
                continue;
            }

            let snapshot = ClipboardSnapshot::capture(&content);
            if last_emitted.as_ref() == Some(&snapshot) {
                continue;
            }
            if mask.matches(&snapshot).await {
                // Treat the echoed value as seen so it cannot fire after
                // the mask entry ages out.
                last_emitted = Some(snapshot);
                continue;
            }

            let Some(change) = classify(content, &config) else {
                continue;
            };
            debug!(kind = change_kind(&change), "clipboard change detected");
            last_emitted = Some(snapshot);
            if tx.send(change).await.is_err() {
                break;
            }
        }
    });

    rx
}

async fn read_with_retry(
    adapter: &dyn ClipboardAdapter,
) -> Result<ClipboardContent, ClipboardError> {
    let mut last_err = None;
    for attempt in 0..READ_RETRIES {
        match adapter.read().await {
            Ok(content) => return Ok(content),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < READ_RETRIES {
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(ClipboardError::Unavailable("no adapter response".into())))
}

fn kind_enabled(content: &ClipboardContent, config: &Config) -> bool {
    match content {
        ClipboardContent::Text(_) => config.sync_text,
        ClipboardContent::Image(_) => config.sync_images,
        ClipboardContent::Files(_) => config.sync_files,
        ClipboardContent::Empty => false,
    }
}

fn classify(content: ClipboardContent, config: &Config) -> Option<ClipboardChange> {
    match content {
        ClipboardContent::Text(text) => {
            if text.is_empty() {
                None
            } else {
                Some(ClipboardChange::Text(text))
            }
        }
        ClipboardContent::Image(bytes) => Some(ClipboardChange::Image(normalize(&bytes))),
        ClipboardContent::Files(paths) => {
            if paths.is_empty() {
                return None;
            }
            let total: u64 = paths
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum();
            if total >= config.lazy_threshold {
                Some(ClipboardChange::LargeFiles(paths))
            } else {
                Some(ClipboardChange::InlineFiles(paths))
            }
        }
        ClipboardContent::Empty => None,
    }
}

fn change_kind(change: &ClipboardChange) -> &'static str {
    match change {
        ClipboardChange::Text(_) => "text",
        ClipboardChange::Image(_) => "image",
        ClipboardChange::InlineFiles(_) => "inline-files",
        ClipboardChange::LargeFiles(_) => "large-files",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MockClipboard;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            poll_interval_ms: 10,
            lazy_threshold: 100,
            ..Config::default()
        })
    }

    async fn recv_timeout(
        rx: &mut mpsc::Receiver<ClipboardChange>,
        millis: u64,
    ) -> Option<ClipboardChange> {
        tokio::time::timeout(Duration::from_millis(millis), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn same_value_twice_emits_once() {
        let adapter = Arc::new(MockClipboard::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut rx = spawn(
            adapter.clone(),
            test_config(),
            EchoMask::new(),
            stop_rx,
        );

        adapter.set(ClipboardContent::Text("hello".into())).await;
        assert_eq!(
            recv_timeout(&mut rx, 500).await,
            Some(ClipboardChange::Text("hello".into()))
        );

        // The unchanged value must not fire again.
        assert!(recv_timeout(&mut rx, 100).await.is_none());

        adapter.set(ClipboardContent::Text("world".into())).await;
        assert_eq!(
            recv_timeout(&mut rx, 500).await,
            Some(ClipboardChange::Text("world".into()))
        );
    }

    #[tokio::test]
    async fn masked_content_is_suppressed() {
        let adapter = Arc::new(MockClipboard::new());
        let mask = EchoMask::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut rx = spawn(adapter.clone(), test_config(), mask.clone(), stop_rx);

        mask.install(ClipboardSnapshot::of_text("from peer")).await;
        adapter
            .set(ClipboardContent::Text("from peer".into()))
            .await;
        assert!(recv_timeout(&mut rx, 150).await.is_none());

        // A genuinely new value still flows.
        adapter.set(ClipboardContent::Text("local copy".into())).await;
        assert_eq!(
            recv_timeout(&mut rx, 500).await,
            Some(ClipboardChange::Text("local copy".into()))
        );
    }

    #[tokio::test]
    async fn masked_content_stays_suppressed_after_mask_expiry() {
        let adapter = Arc::new(MockClipboard::new());
        let mask = EchoMask::with_ttl(Duration::from_millis(30));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut rx = spawn(adapter.clone(), test_config(), mask.clone(), stop_rx);

        mask.install(ClipboardSnapshot::of_text("echo")).await;
        adapter.set(ClipboardContent::Text("echo".into())).await;

        // Wait out the mask TTL; the value was marked seen, so it still
        // must not fire.
        assert!(recv_timeout(&mut rx, 200).await.is_none());
    }

    #[tokio::test]
    async fn files_classify_by_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.bin");
        let large = dir.path().join("large.bin");
        std::fs::write(&small, vec![0u8; 10]).unwrap();
        std::fs::write(&large, vec![0u8; 200]).unwrap();

        let adapter = Arc::new(MockClipboard::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut rx = spawn(
            adapter.clone(),
            test_config(), // lazy_threshold = 100
            EchoMask::new(),
            stop_rx,
        );

        adapter
            .set(ClipboardContent::Files(vec![small.clone()]))
            .await;
        assert_eq!(
            recv_timeout(&mut rx, 500).await,
            Some(ClipboardChange::InlineFiles(vec![small]))
        );

        adapter
            .set(ClipboardContent::Files(vec![large.clone()]))
            .await;
        assert_eq!(
            recv_timeout(&mut rx, 500).await,
            Some(ClipboardChange::LargeFiles(vec![large]))
        );
    }

    #[tokio::test]
    async fn disabled_kinds_do_not_emit() {
        let adapter = Arc::new(MockClipboard::new());
        let config = Arc::new(Config {
            poll_interval_ms: 10,
            sync_text: false,
            ..Config::default()
        });
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut rx = spawn(adapter.clone(), config, EchoMask::new(), stop_rx);

        adapter.set(ClipboardContent::Text("ignored".into())).await;
        assert!(recv_timeout(&mut rx, 150).await.is_none());
    }
}
