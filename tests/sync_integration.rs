//! End-to-end agent tests over 127.0.0.1 with mock clipboard adapters.
//!
//! Two agents share a pre-seeded pairing; discovery is disabled and the
//! connector is pointed straight at the listener.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use yank::auth::{PairingRecord, PairingStore, SharedSecret};
use yank::clipboard::{ClipboardContent, MockClipboard};
use yank::config::Config;
use yank::ignore::SyncIgnore;
use yank::sync::events::{AgentState, ErrorKind, EventSink, NullSink};
use yank::sync::{AgentOptions, SyncAgent};
use yank::transfer::{new_transfer_id, FileMetadata, Side, TransferStatus};
use yank::transport::{Connection, Message, RequestHeader, TransferErrorCode};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

fn seed_pairing(dir: &TempDir, device_id: &str, peer_id: &str) -> Arc<PairingStore> {
    let store = PairingStore::new(dir.path().join("pairing.json"));
    store
        .save(&PairingRecord {
            device_id: device_id.to_string(),
            device_name: format!("{device_id} (test)"),
            peer_device_id: peer_id.to_string(),
            peer_name: format!("{peer_id} (test)"),
            shared_secret_b64: SharedSecret::new([77u8; 32]).to_base64(),
            created_at: Utc::now(),
            last_seen: None,
        })
        .expect("seed pairing");
    Arc::new(store)
}

/// Sink collecting progress byte counts and completion paths.
#[derive(Default)]
struct RecordingSink {
    progress: Mutex<Vec<u64>>,
    completed: Mutex<Vec<Vec<PathBuf>>>,
    errors: Mutex<Vec<(ErrorKind, String)>>,
}

impl EventSink for RecordingSink {
    fn on_progress(
        &self,
        _transfer_id: &str,
        bytes_done: u64,
        _bytes_total: u64,
        _speed_bps: f64,
        _eta_s: f64,
    ) {
        self.progress.lock().unwrap().push(bytes_done);
    }

    fn on_complete(&self, _transfer_id: &str, paths: &[PathBuf]) {
        self.completed.lock().unwrap().push(paths.to_vec());
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        self.errors.lock().unwrap().push((kind, detail.to_string()));
    }
}

struct TestPeer {
    agent: Arc<SyncAgent>,
    clipboard: Arc<MockClipboard>,
    downloads: TempDir,
    _store_dir: TempDir,
}

fn test_config(port: u16, tweak: impl FnOnce(&mut Config)) -> Arc<Config> {
    let mut config = Config {
        port,
        poll_interval_ms: 20,
        ..Config::default()
    };
    tweak(&mut config);
    Arc::new(config)
}

fn build_peer(
    device_id: &str,
    peer_id: &str,
    config: Arc<Config>,
    peer_override: Option<std::net::SocketAddr>,
    sink: Arc<dyn EventSink>,
) -> TestPeer {
    let store_dir = TempDir::new().expect("store dir");
    let downloads = TempDir::new().expect("downloads dir");
    let store = seed_pairing(&store_dir, device_id, peer_id);
    let clipboard = Arc::new(MockClipboard::with_download_dir(
        downloads.path().to_path_buf(),
    ));

    let agent = SyncAgent::new(
        config,
        store,
        clipboard.clone(),
        sink,
        Arc::new(SyncIgnore::default()),
        AgentOptions {
            peer_override,
            secure: true,
            enable_discovery: false,
        },
    )
    .expect("agent builds");

    TestPeer {
        agent,
        clipboard,
        downloads,
        _store_dir: store_dir,
    }
}

async fn start_connected_pair(
    tweak: impl Fn(&mut Config) + Copy,
    sink_a: Arc<dyn EventSink>,
    sink_b: Arc<dyn EventSink>,
) -> (TestPeer, TestPeer) {
    let port_a = free_port();
    let port_b = free_port();

    let a = build_peer("aaaa", "bbbb", test_config(port_a, tweak), None, sink_a);
    let b = build_peer(
        "bbbb",
        "aaaa",
        test_config(port_b, tweak),
        Some(format!("127.0.0.1:{port_a}").parse().unwrap()),
        sink_b,
    );

    tokio::spawn(a.agent.clone().run());
    tokio::spawn(b.agent.clone().run());

    wait_until(Duration::from_secs(10), || {
        a.agent.state() == AgentState::Connected && b.agent.state() == AgentState::Connected
    })
    .await
    .expect("agents connect");

    (a, b)
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> Result<(), ()> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(())
}

async fn wait_for_write(
    clipboard: &MockClipboard,
    deadline: Duration,
) -> Option<ClipboardContent> {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Some(content) = clipboard.last_write().await {
            return Some(content);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    None
}

#[tokio::test]
async fn text_round_trip() {
    let (a, b) = start_connected_pair(|_| {}, Arc::new(NullSink), Arc::new(NullSink)).await;

    a.clipboard
        .set(ClipboardContent::Text("hello world".into()))
        .await;

    let received = wait_for_write(&b.clipboard, Duration::from_secs(5))
        .await
        .expect("text arrives");
    assert_eq!(received, ClipboardContent::Text("hello world".into()));

    // Echo suppression: the received value must not bounce back to A.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.clipboard.writes().await.is_empty());
    assert_eq!(b.clipboard.writes().await.len(), 1);

    a.agent.shutdown();
    b.agent.shutdown();
}

#[tokio::test]
async fn inline_files_round_trip() {
    let src = TempDir::new().unwrap();
    let sizes = [1000usize, 2000, 4000];
    let mut paths = Vec::new();
    for (i, size) in sizes.iter().enumerate() {
        let path = src.path().join(format!("file{i}.dat"));
        let content: Vec<u8> = (0..*size).map(|b| (b % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        paths.push(path);
    }

    let (a, b) = start_connected_pair(|_| {}, Arc::new(NullSink), Arc::new(NullSink)).await;

    a.clipboard.set(ClipboardContent::Files(paths.clone())).await;

    let received = wait_for_write(&b.clipboard, Duration::from_secs(5))
        .await
        .expect("files arrive");
    let ClipboardContent::Files(received_paths) = received else {
        panic!("expected files on the clipboard");
    };
    assert_eq!(received_paths.len(), 3);

    for (original, received) in paths.iter().zip(&received_paths) {
        let want = std::fs::read(original).unwrap();
        let got = std::fs::read(received).unwrap();
        assert_eq!(want, got, "content mismatch for {}", received.display());
        assert!(received.starts_with(b.downloads.path()));
    }

    a.agent.shutdown();
    b.agent.shutdown();
}

#[tokio::test]
async fn lazy_transfer_streams_chunks_with_progress() {
    let src = TempDir::new().unwrap();
    let big = src.path().join("big.bin");
    let content: Vec<u8> = (0..200_000usize).map(|b| (b % 241) as u8).collect();
    std::fs::write(&big, &content).unwrap();

    let sink_b = Arc::new(RecordingSink::default());
    let tweak = |config: &mut Config| {
        config.lazy_threshold = 64 * 1024;
        config.chunk_size = 16 * 1024;
    };
    let (a, b) =
        start_connected_pair(tweak, Arc::new(NullSink), sink_b.clone() as Arc<dyn EventSink>)
            .await;

    a.clipboard
        .set(ClipboardContent::Files(vec![big.clone()]))
        .await;

    let received = wait_for_write(&b.clipboard, Duration::from_secs(15))
        .await
        .expect("large file arrives");
    let ClipboardContent::Files(received_paths) = received else {
        panic!("expected files on the clipboard");
    };
    assert_eq!(received_paths.len(), 1);
    let final_path = &received_paths[0];

    assert_eq!(std::fs::read(final_path).unwrap(), content);

    // Progress was reported with non-decreasing byte counts.
    let progress = sink_b.progress.lock().unwrap().clone();
    assert!(progress.len() >= 2, "expected several progress callbacks");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), content.len() as u64);

    // No partial file remains next to the final one.
    let parent = final_path.parent().unwrap();
    let leftovers: Vec<_> = std::fs::read_dir(parent)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "part"))
        .collect();
    assert!(leftovers.is_empty(), "no .part file may remain");

    let completed = sink_b.completed.lock().unwrap();
    assert_eq!(completed.len(), 1);

    a.agent.shutdown();
    b.agent.shutdown();
}

#[tokio::test]
async fn request_for_unknown_transfer_yields_expired_error() {
    let port_a = free_port();
    let a = build_peer(
        "aaaa",
        "bbbb",
        test_config(port_a, |_| {}),
        None,
        Arc::new(NullSink),
    );
    tokio::spawn(a.agent.clone().run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Act as peer B at the transport level.
    let store_dir = TempDir::new().unwrap();
    let store = seed_pairing(&store_dir, "bbbb", "aaaa");
    let record = store.load().unwrap().unwrap();

    let mut conn = Connection::connect(
        format!("127.0.0.1:{port_a}").parse().unwrap(),
        &record,
        true,
    )
    .await
    .expect("transport connects");

    conn.sender
        .send(&Message::Request(RequestHeader {
            transfer_id: "00".repeat(16),
            offset: 0,
        }))
        .await
        .expect("request sends");

    let error = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), conn.reader.next())
            .await
            .expect("reply in time")
            .expect("connection stays up");
        match message {
            Message::TransferError(header) => break header,
            Message::Heartbeat => continue,
            other => panic!("unexpected message: {}", other.name()),
        }
    };
    assert_eq!(error.code, TransferErrorCode::ExpiredOrUnknown);

    a.agent.shutdown();
}

#[tokio::test]
async fn request_for_canceled_transfer_yields_expired_error() {
    let src = TempDir::new().unwrap();
    let path = src.path().join("old.bin");
    std::fs::write(&path, b"superseded content").unwrap();

    let port_a = free_port();
    let a = build_peer(
        "aaaa",
        "bbbb",
        test_config(port_a, |_| {}),
        None,
        Arc::new(NullSink),
    );
    tokio::spawn(a.agent.clone().run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // An announce the sender has since canceled (a newer copy superseded
    // it) must not be servable, even though its TTL has not run out.
    let transfer_id = new_transfer_id();
    a.agent.registry().register_announced(
        &transfer_id,
        vec![FileMetadata {
            name: "old.bin".into(),
            size: 18,
            checksum: "00".repeat(32),
            mime_hint: None,
        }],
        vec![path],
    );
    a.agent
        .registry()
        .mark(Side::Announced, &transfer_id, TransferStatus::Canceled);

    let store_dir = TempDir::new().unwrap();
    let store = seed_pairing(&store_dir, "bbbb", "aaaa");
    let record = store.load().unwrap().unwrap();

    let mut conn = Connection::connect(
        format!("127.0.0.1:{port_a}").parse().unwrap(),
        &record,
        true,
    )
    .await
    .expect("transport connects");

    conn.sender
        .send(&Message::Request(RequestHeader {
            transfer_id: transfer_id.clone(),
            offset: 0,
        }))
        .await
        .expect("request sends");

    let error = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), conn.reader.next())
            .await
            .expect("reply in time")
            .expect("connection stays up");
        match message {
            Message::TransferError(header) => break header,
            Message::Heartbeat => continue,
            Message::Chunk { .. } => panic!("canceled transfer must not stream chunks"),
            other => panic!("unexpected message: {}", other.name()),
        }
    };
    assert_eq!(error.transfer_id, transfer_id);
    assert_eq!(error.code, TransferErrorCode::ExpiredOrUnknown);

    a.agent.shutdown();
}

#[tokio::test]
async fn second_connection_is_rejected_while_one_is_active() {
    let (a, b) = start_connected_pair(|_| {}, Arc::new(NullSink), Arc::new(NullSink)).await;

    // A second connector with valid credentials must not displace the
    // live connection.
    let store_dir = TempDir::new().unwrap();
    let store = seed_pairing(&store_dir, "bbbb", "aaaa");
    let record = store.load().unwrap().unwrap();

    let addr = format!("127.0.0.1:{}", a.agent_port()).parse().unwrap();
    let result = Connection::connect(addr, &record, true).await;
    assert!(result.is_err(), "second connection must be rejected");

    // The original pair still works.
    a.clipboard
        .set(ClipboardContent::Text("still alive".into()))
        .await;
    assert_eq!(
        wait_for_write(&b.clipboard, Duration::from_secs(5)).await,
        Some(ClipboardContent::Text("still alive".into()))
    );

    a.agent.shutdown();
    b.agent.shutdown();
}

impl TestPeer {
    fn agent_port(&self) -> u16 {
        self.agent.port()
    }
}

#[tokio::test]
async fn shutdown_is_prompt() {
    let (a, b) = start_connected_pair(|_| {}, Arc::new(NullSink), Arc::new(NullSink)).await;

    let started = tokio::time::Instant::now();
    a.agent.shutdown();
    b.agent.shutdown();

    wait_until(Duration::from_secs(6), || {
        a.agent.state() == AgentState::Closed && b.agent.state() == AgentState::Closed
    })
    .await
    .expect("agents close");
    assert!(started.elapsed() < Duration::from_secs(6));
}
