//! Sync agent — orchestration of transport, watcher, and transfers
//!
//! The agent owns the transfer registry, the clipboard watcher, and the
//! single active connection. Long-lived tasks: listener, connector,
//! per-connection read loop (the sole inbound dispatcher), heartbeat,
//! clipboard watcher, and the registry janitor. Socket writes are
//! serialized by the connection-level mutex inside
//! [`ConnectionSender`]; the registry lock is never held across file or
//! network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub mod events;

use crate::auth::{AuthError, PairingRecord, PairingStore};
use crate::clipboard::image::NormalizedImage;
use crate::clipboard::watcher::{self, ClipboardChange, EchoMask};
use crate::clipboard::{
    basename, ClipboardAdapter, ClipboardContent, ClipboardError, ClipboardSnapshot,
};
use crate::config::Config;
use crate::discovery::{Discovery, PeerSlot, DISCOVERY_GRACE};
use crate::ignore::SyncIgnore;
use crate::transfer::chunked::{
    file_digest, sha256_hex, ChunkedFileReader, ChunkedFileWriter, TransferStats,
};
use crate::transfer::{
    new_transfer_id, FileMetadata, Side, TransferRecord, TransferRegistry, TransferStatus,
    SWEEP_INTERVAL,
};
use crate::transport::{
    AnnounceHeader, CancelHeader, ChunkHeader, CompleteHeader, Connection, ConnectionSender,
    FilesInlineHeader, ImageHeader, Message, ProtocolError, RequestHeader, TransferErrorCode,
    TransferErrorHeader, TransportError, BACKOFF_SCHEDULE, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT,
};
use events::{AgentState, ErrorKind, EventSink};

/// Retry delays for transient inbound transfer errors.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

const INSTALL_RETRIES: u32 = 3;
const INSTALL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Agent construction options beyond the config file.
pub struct AgentOptions {
    /// Fallback peer address when discovery stays silent
    pub peer_override: Option<SocketAddr>,
    /// False only under `--no-security`
    pub secure: bool,
    /// Disabled in tests that run without mDNS
    pub enable_discovery: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            peer_override: None,
            secure: true,
            enable_discovery: true,
        }
    }
}

struct ActiveConn {
    sender: ConnectionSender,
    peer_addr: SocketAddr,
}

struct OutboundHandle {
    transfer_id: String,
    cancel: Arc<AtomicBool>,
}

struct InboundTransfer {
    dest_dir: PathBuf,
    writers: HashMap<u32, ChunkedFileWriter>,
    finalized: Vec<(u32, PathBuf)>,
    bytes_done: u64,
    stats: TransferStats,
}

impl InboundTransfer {
    fn new(record: &TransferRecord) -> Self {
        let dest_dir = record
            .dest_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self {
            dest_dir,
            writers: HashMap::new(),
            finalized: Vec::new(),
            bytes_done: record.bytes_done,
            stats: TransferStats::new(record.bytes_total),
        }
    }
}

/// The sync agent. Owns everything between the clipboard adapter and
/// the wire.
pub struct SyncAgent {
    config: Arc<Config>,
    store: Arc<PairingStore>,
    record: PairingRecord,
    adapter: Arc<dyn ClipboardAdapter>,
    events: Arc<dyn EventSink>,
    ignore: Arc<SyncIgnore>,
    registry: Arc<TransferRegistry>,
    slot: PeerSlot,
    mask: EchoMask,
    opts: AgentOptions,
    state: std::sync::Mutex<AgentState>,
    conn: RwLock<Option<ActiveConn>>,
    outbound: Mutex<Option<OutboundHandle>>,
    inbound: Mutex<HashMap<String, InboundTransfer>>,
    stop_tx: watch::Sender<bool>,
}

impl SyncAgent {
    /// Build an agent. Fails with `NotPaired` when no pairing exists.
    pub fn new(
        config: Arc<Config>,
        store: Arc<PairingStore>,
        adapter: Arc<dyn ClipboardAdapter>,
        events: Arc<dyn EventSink>,
        ignore: Arc<SyncIgnore>,
        opts: AgentOptions,
    ) -> crate::Result<Arc<Self>> {
        let record = store.load()?.ok_or(AuthError::NotPaired)?;
        let registry = Arc::new(TransferRegistry::new(config.transfer_ttl()));
        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            record,
            adapter,
            events,
            ignore,
            registry,
            slot: PeerSlot::new(),
            mask: EchoMask::new(),
            opts,
            state: std::sync::Mutex::new(AgentState::Idle),
            conn: RwLock::new(None),
            outbound: Mutex::new(None),
            inbound: Mutex::new(HashMap::new()),
            stop_tx,
        }))
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Configured service port.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn state(&self) -> AgentState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(AgentState::Closed)
    }

    /// Signal every task to wind down; `run` returns shortly after.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn set_state(&self, next: AgentState) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            *state = next;
            drop(state);
            self.events.on_state(next);
        }
    }

    fn stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    async fn current_sender(&self) -> Option<ConnectionSender> {
        self.conn.read().await.as_ref().map(|c| c.sender.clone())
    }

    /// Run until [`SyncAgent::shutdown`] is called.
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        self.set_state(AgentState::Idle);

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(TransportError::Connect)?;
        let local_port = listener.local_addr()?.port();
        info!(port = local_port, "agent listening");

        let mut discovery = None;
        if self.opts.enable_discovery {
            let mut d = Discovery::new()?;
            d.advertise(&self.record.device_id, &self.record.device_name, local_port)?;
            d.browse(
                self.record.peer_device_id.clone(),
                self.record.device_id.clone(),
                self.slot.clone(),
            )?;
            discovery = Some(d);
        }

        let changes = watcher::spawn(
            self.adapter.clone(),
            self.config.clone(),
            self.mask.clone(),
            self.stop_tx.subscribe(),
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().listener_loop(listener));
        tasks.spawn(self.clone().connector_loop());
        tasks.spawn(self.clone().outbound_loop(changes));
        tasks.spawn(self.clone().sweep_loop());

        // Park until shutdown.
        let mut stop = self.stop_tx.subscribe();
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                break;
            }
        }

        self.set_state(AgentState::Closed);
        if let Some(mut d) = discovery {
            d.shutdown();
        }
        if let Some(conn) = self.conn.write().await.take() {
            conn.sender.close().await;
        }

        // Give workers a grace period, then abort stragglers.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("workers did not stop in time; aborting");
            tasks.abort_all();
        }
        Ok(())
    }

    // ---------- long-lived workers ----------

    async fn listener_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if self.conn.read().await.is_some() {
                                // One authenticated connection at a time.
                                warn!(peer = %addr, "rejecting connection while another is active");
                                drop(stream);
                                continue;
                            }
                            self.set_state(AgentState::Authenticating);
                            match Connection::accept(stream, &self.record, self.opts.secure).await {
                                Ok(conn) => {
                                    let _ = self.store.touch_last_seen();
                                    self.clone().install_connection(conn).await;
                                }
                                Err(e) => {
                                    self.events.on_error(transport_error_kind(&e), &e.to_string());
                                    self.set_state(AgentState::Idle);
                                }
                            }
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn connector_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let started = Instant::now();
        let mut backoff_idx = 0usize;

        loop {
            if *stop.borrow() {
                break;
            }
            if self.conn.read().await.is_some() {
                if wait_or_stop(&mut stop, Duration::from_millis(500)).await {
                    break;
                }
                continue;
            }

            let addr = match self.slot.get().await {
                Some(addr) => Some(addr),
                None if !self.opts.enable_discovery
                    || started.elapsed() >= DISCOVERY_GRACE =>
                {
                    self.opts.peer_override
                }
                None => None,
            };
            let Some(addr) = addr else {
                if wait_or_stop(&mut stop, Duration::from_millis(500)).await {
                    break;
                }
                continue;
            };

            self.set_state(AgentState::Connecting);
            self.set_state(AgentState::Authenticating);
            match Connection::connect(addr, &self.record, self.opts.secure).await {
                Ok(conn) => {
                    backoff_idx = 0;
                    let _ = self.store.touch_last_seen();
                    self.clone().install_connection(conn).await;
                }
                Err(e) => {
                    debug!(peer = %addr, "connect failed: {e}");
                    self.set_state(AgentState::Idle);
                    let delay = BACKOFF_SCHEDULE
                        [backoff_idx.min(BACKOFF_SCHEDULE.len() - 1)];
                    backoff_idx = (backoff_idx + 1).min(BACKOFF_SCHEDULE.len());
                    if wait_or_stop(&mut stop, Duration::from_secs(delay)).await {
                        break;
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            if wait_or_stop(&mut stop, SWEEP_INTERVAL).await {
                break;
            }
            for record in self.registry.sweep_expired() {
                debug!(transfer_id = %record.transfer_id, "swept expired transfer");
                let mut inbound = self.inbound.lock().await;
                if let Some(entry) = inbound.remove(&record.transfer_id) {
                    for (_, writer) in entry.writers {
                        writer.abort().await;
                    }
                }
            }
        }
    }

    async fn outbound_loop(self: Arc<Self>, mut changes: mpsc::Receiver<ClipboardChange>) {
        while let Some(change) = changes.recv().await {
            if self.stopping() {
                break;
            }
            let Some(sender) = self.current_sender().await else {
                debug!("clipboard change dropped: no connection");
                continue;
            };
            let result = match change {
                ClipboardChange::Text(text) => self.send_text(&sender, text).await,
                ClipboardChange::Image(image) => self.send_image(&sender, image).await,
                ClipboardChange::InlineFiles(paths) => {
                    self.send_inline_files(&sender, paths).await
                }
                ClipboardChange::LargeFiles(paths) => self.send_announce(&sender, paths).await,
            };
            if let Err(e) = result {
                self.events.on_error(error_kind(&e), &e.to_string());
            }
        }
    }

    // ---------- connection lifecycle ----------

    async fn install_connection(self: Arc<Self>, conn: Connection) {
        let Connection {
            peer_addr,
            reader,
            sender,
        } = conn;

        {
            let mut slot = self.conn.write().await;
            *slot = Some(ActiveConn {
                sender: sender.clone(),
                peer_addr,
            });
        }
        info!(peer = %peer_addr, "connection established");
        self.set_state(AgentState::Connected);

        let heartbeat_sender = sender.clone();
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if wait_or_stop(&mut stop, HEARTBEAT_INTERVAL).await {
                    break;
                }
                if heartbeat_sender.send(&Message::Heartbeat).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(self.read_loop(reader, sender));
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: crate::transport::ConnectionReader,
        sender: ConnectionSender,
    ) {
        loop {
            match tokio::time::timeout(LIVENESS_TIMEOUT, reader.next()).await {
                Err(_) => {
                    self.events
                        .on_error(ErrorKind::ConnectionLost, "peer stopped responding");
                    break;
                }
                Ok(Err(TransportError::Closed)) => {
                    info!("peer closed the connection");
                    break;
                }
                Ok(Err(e)) => {
                    self.events.on_error(transport_error_kind(&e), &e.to_string());
                    break;
                }
                Ok(Ok(message)) => {
                    if let Err(e) = self.clone().handle_inbound(message, &sender).await {
                        self.events.on_error(error_kind(&e), &e.to_string());
                        break;
                    }
                }
            }
        }
        self.teardown_connection(&sender).await;
    }

    async fn teardown_connection(&self, sender: &ConnectionSender) {
        {
            // Only clear the slot if it still holds this connection; a
            // replacement may already be installed.
            let mut slot = self.conn.write().await;
            if let Some(active) = slot.as_ref() {
                if active.sender.same_channel(sender) {
                    debug!(peer = %active.peer_addr, "clearing connection slot");
                    slot.take();
                }
            }
        }
        sender.close().await;
        let failed = self.registry.fail_in_flight();
        if !failed.is_empty() {
            warn!(transfers = failed.len(), "in-flight transfers failed on disconnect");
        }
        let mut inbound = self.inbound.lock().await;
        for (_, entry) in inbound.drain() {
            for (_, writer) in entry.writers {
                writer.abort().await;
            }
        }
        drop(inbound);
        *self.outbound.lock().await = None;

        if !self.stopping() {
            self.set_state(AgentState::Degraded);
            self.set_state(AgentState::Connecting);
        }
    }

    // ---------- inbound dispatch ----------

    /// Single dispatcher for every post-handshake frame. Returns `Err`
    /// only for failures that must terminate the connection; transfer-
    /// scoped problems are absorbed here.
    async fn handle_inbound(
        self: Arc<Self>,
        message: Message,
        sender: &ConnectionSender,
    ) -> crate::Result<()> {
        match message {
            Message::Heartbeat => Ok(()),

            Message::Text { content } => {
                self.install(&ClipboardContent::Text(content)).await;
                Ok(())
            }

            Message::Image { header, payload } => {
                debug!(
                    width = header.width,
                    height = header.height,
                    format = %header.format,
                    "image received"
                );
                self.install(&ClipboardContent::Image(payload)).await;
                Ok(())
            }

            Message::FilesInline { header, payload } => {
                self.handle_files_inline(header, payload).await
            }

            Message::Announce(header) => self.handle_announce(header, sender).await,

            Message::Request(header) => self.handle_request(header, sender).await,

            Message::Chunk { header, payload } => {
                self.handle_chunk(header, payload, sender).await
            }

            Message::Complete(header) => self.handle_complete(header).await,

            Message::Cancel(header) => {
                info!(transfer_id = %header.transfer_id, reason = %header.reason, "transfer cancelled by peer");
                self.abort_inbound(&header.transfer_id).await;
                self.registry.remove(Side::Pending, &header.transfer_id);
                self.registry
                    .mark(Side::Announced, &header.transfer_id, TransferStatus::Canceled);
                Ok(())
            }

            Message::TransferError(header) => self.handle_transfer_error(header, sender).await,

            // Handshake or pairing frames have no business after OK.
            other => Err(TransportError::Protocol(ProtocolError::Unexpected {
                phase: "session",
                got: other.name(),
            })
            .into()),
        }
    }

    async fn handle_files_inline(
        &self,
        header: FilesInlineHeader,
        payload: Vec<u8>,
    ) -> crate::Result<()> {
        let total: u64 = header.files.iter().map(|f| f.size).sum();
        if payload.len() as u64 != total {
            return Err(TransportError::Protocol(ProtocolError::Truncated).into());
        }

        let dir = self.receive_dir(&format!(
            "inline-{}",
            chrono::Utc::now().timestamp_millis()
        ));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            self.events
                .on_error(ErrorKind::Internal, &format!("cannot create {}: {e}", dir.display()));
            return Ok(());
        }

        let mut paths = Vec::with_capacity(header.files.len());
        let mut offset = 0usize;
        for meta in &header.files {
            let end = offset + meta.size as usize;
            let slice = &payload[offset..end];
            offset = end;

            if sha256_hex(slice) != meta.checksum {
                self.events.on_error(
                    ErrorKind::ChecksumMismatch,
                    &format!("inline file {} failed verification", meta.name),
                );
                return Ok(());
            }
            let path = dir.join(safe_name(&meta.name));
            if let Err(e) = tokio::fs::write(&path, slice).await {
                self.events
                    .on_error(ErrorKind::Internal, &format!("cannot write {}: {e}", path.display()));
                return Ok(());
            }
            paths.push(path);
        }

        info!(files = paths.len(), "inline files received");
        self.install(&ClipboardContent::Files(paths)).await;
        Ok(())
    }

    async fn handle_announce(
        &self,
        header: AnnounceHeader,
        sender: &ConnectionSender,
    ) -> crate::Result<()> {
        let label = format!("recv-{}", &header.transfer_id[..header.transfer_id.len().min(8)]);
        let dir = self.receive_dir(&label);
        let ttl = Duration::from_secs(header.ttl_secs.max(1));
        self.registry
            .register_pending(&header.transfer_id, header.files.clone(), ttl, dir);
        self.events.on_announced(&header.transfer_id, &header.files);

        // Eager policy: request immediately. A lazy adapter would defer
        // this until its placeholder is first read.
        sender
            .send(&Message::Request(RequestHeader {
                transfer_id: header.transfer_id,
                offset: 0,
            }))
            .await?;
        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        header: RequestHeader,
        sender: &ConnectionSender,
    ) -> crate::Result<()> {
        let record = self.registry.get(Side::Announced, &header.transfer_id);
        // A canceled, failed, or already-completed announce is as dead as
        // an unknown one; serving it would resurrect a superseded
        // transfer alongside the live one.
        let record = match record {
            Some(record)
                if !record.is_expired(Instant::now())
                    && matches!(
                        record.status,
                        TransferStatus::Pending | TransferStatus::Transferring
                    ) =>
            {
                record
            }
            _ => {
                sender
                    .send(&Message::TransferError(TransferErrorHeader {
                        transfer_id: header.transfer_id.clone(),
                        code: TransferErrorCode::ExpiredOrUnknown,
                        detail: "no such transfer or announce expired".into(),
                    }))
                    .await?;
                return Ok(());
            }
        };

        let cancel = {
            let mut outbound = self.outbound.lock().await;
            match outbound.as_ref() {
                Some(handle) if handle.transfer_id == record.transfer_id => {
                    handle.cancel.clone()
                }
                _ => {
                    let cancel = Arc::new(AtomicBool::new(false));
                    *outbound = Some(OutboundHandle {
                        transfer_id: record.transfer_id.clone(),
                        cancel: cancel.clone(),
                    });
                    cancel
                }
            }
        };

        let agent = self.clone();
        let sender = sender.clone();
        let offset = header.offset;
        tokio::spawn(async move {
            agent.serve_transfer(record, offset, sender, cancel).await;
        });
        Ok(())
    }

    async fn handle_chunk(
        &self,
        header: ChunkHeader,
        payload: Vec<u8>,
        sender: &ConnectionSender,
    ) -> crate::Result<()> {
        if header.length as usize != payload.len() {
            return Err(TransportError::Protocol(ProtocolError::Truncated).into());
        }
        let Some(record) = self.registry.get(Side::Pending, &header.transfer_id) else {
            debug!(transfer_id = %header.transfer_id, "chunk for unknown transfer");
            return Ok(());
        };
        let Some(meta) = record.files.get(header.file_index as usize).cloned() else {
            return Err(TransportError::Protocol(ProtocolError::Unexpected {
                phase: "chunk dispatch",
                got: "FILE_CHUNK with out-of-range file index",
            })
            .into());
        };

        let mut inbound = self.inbound.lock().await;
        let entry = inbound
            .entry(header.transfer_id.clone())
            .or_insert_with(|| InboundTransfer::new(&record));

        if !entry.writers.contains_key(&header.file_index) {
            let dest_dir = entry.dest_dir.clone();
            let writer = ChunkedFileWriter::create(
                &dest_dir,
                &safe_name(&meta.name),
                meta.size,
                &meta.checksum,
            )
            .await;
            match writer {
                Ok(writer) => {
                    entry.writers.insert(header.file_index, writer);
                }
                Err(e) => {
                    drop(inbound);
                    self.fail_pending(&header.transfer_id, ErrorKind::Internal, &e.to_string())
                        .await;
                    return Ok(());
                }
            }
        }

        let write_result = match entry.writers.get_mut(&header.file_index) {
            Some(writer) => {
                writer
                    .write_chunk(header.offset, &payload, &header.chunk_checksum)
                    .await
            }
            None => return Ok(()),
        };
        if let Err(e) = write_result {
            drop(inbound);
            let kind = match &e {
                crate::transfer::TransferError::ChecksumMismatch { .. } => {
                    ErrorKind::ChecksumMismatch
                }
                _ => ErrorKind::Internal,
            };
            self.fail_pending(&header.transfer_id, kind, &e.to_string()).await;
            // Tell the peer to stop streaming this transfer.
            let _ = sender
                .send(&Message::Cancel(CancelHeader {
                    transfer_id: header.transfer_id.clone(),
                    reason: e.to_string(),
                }))
                .await;
            return Ok(());
        }

        entry.bytes_done += payload.len() as u64;
        let bytes_done = entry.bytes_done;
        let (speed, eta) = entry.stats.update(bytes_done);

        // Finalize this file once its byte count completes.
        let completed = entry
            .writers
            .get(&header.file_index)
            .map(|w| w.is_complete())
            .unwrap_or(false);
        if completed {
            if let Some(writer) = entry.writers.remove(&header.file_index) {
                match writer.finalize().await {
                    Ok(path) => entry.finalized.push((header.file_index, path)),
                    Err(e) => {
                        drop(inbound);
                        self.fail_pending(
                            &header.transfer_id,
                            ErrorKind::ChecksumMismatch,
                            &e.to_string(),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
        drop(inbound);

        // Registry update happens after all file I/O, never under it.
        self.registry
            .update_progress(Side::Pending, &header.transfer_id, bytes_done);
        self.events.on_progress(
            &header.transfer_id,
            bytes_done,
            record.bytes_total,
            speed,
            eta,
        );
        Ok(())
    }

    async fn handle_complete(&self, header: CompleteHeader) -> crate::Result<()> {
        let Some(record) = self.registry.get(Side::Pending, &header.transfer_id) else {
            debug!(transfer_id = %header.transfer_id, "completion for unknown transfer");
            return Ok(());
        };

        let mut inbound = self.inbound.lock().await;
        let mut entry = inbound
            .remove(&header.transfer_id)
            .unwrap_or_else(|| InboundTransfer::new(&record));
        drop(inbound);

        // Zero-byte files produce no chunks; finalize them here so the
        // empty-content checksum is still verified.
        for (index, meta) in record.files.iter().enumerate() {
            let index = index as u32;
            if entry.finalized.iter().any(|(i, _)| *i == index) {
                continue;
            }
            if entry.writers.contains_key(&index) || meta.size > 0 {
                for (_, writer) in entry.writers.drain() {
                    writer.abort().await;
                }
                self.fail_pending(
                    &header.transfer_id,
                    ErrorKind::Internal,
                    &format!("peer completed transfer but {} is unfinished", meta.name),
                )
                .await;
                return Ok(());
            }
            let writer = ChunkedFileWriter::create(
                &entry.dest_dir,
                &safe_name(&meta.name),
                0,
                &meta.checksum,
            )
            .await;
            match writer {
                Ok(writer) => match writer.finalize().await {
                    Ok(path) => entry.finalized.push((index, path)),
                    Err(e) => {
                        self.fail_pending(
                            &header.transfer_id,
                            ErrorKind::ChecksumMismatch,
                            &e.to_string(),
                        )
                        .await;
                        return Ok(());
                    }
                },
                Err(e) => {
                    self.fail_pending(&header.transfer_id, ErrorKind::Internal, &e.to_string())
                        .await;
                    return Ok(());
                }
            }
        }

        entry.finalized.sort_by_key(|(i, _)| *i);
        let paths: Vec<PathBuf> = entry.finalized.into_iter().map(|(_, p)| p).collect();

        self.install(&ClipboardContent::Files(paths.clone())).await;
        self.events.on_complete(&header.transfer_id, &paths);
        self.registry.remove(Side::Pending, &header.transfer_id);
        Ok(())
    }

    async fn handle_transfer_error(
        &self,
        header: TransferErrorHeader,
        sender: &ConnectionSender,
    ) -> crate::Result<()> {
        let kind = match header.code {
            TransferErrorCode::ExpiredOrUnknown => ErrorKind::ExpiredOrUnknownTransfer,
            TransferErrorCode::Checksum => ErrorKind::ChecksumMismatch,
            _ => ErrorKind::Internal,
        };
        self.events.on_error(kind, &header.detail);

        if header.code.is_transient() {
            if let Some(attempt) = self.registry.bump_attempts(&header.transfer_id) {
                if (attempt as usize) <= RETRY_DELAYS.len() {
                    let delay = RETRY_DELAYS[attempt as usize - 1];
                    let resume_from = self
                        .registry
                        .get(Side::Pending, &header.transfer_id)
                        .map(|r| r.bytes_done)
                        .unwrap_or(0);
                    info!(
                        transfer_id = %header.transfer_id,
                        attempt,
                        delay_s = delay.as_secs(),
                        "retrying transfer after transient error"
                    );
                    let sender = sender.clone();
                    let transfer_id = header.transfer_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = sender
                            .send(&Message::Request(RequestHeader {
                                transfer_id,
                                offset: resume_from,
                            }))
                            .await;
                    });
                    return Ok(());
                }
            }
        }

        self.abort_inbound(&header.transfer_id).await;
        self.registry.remove(Side::Pending, &header.transfer_id);
        Ok(())
    }

    async fn abort_inbound(&self, transfer_id: &str) {
        let mut inbound = self.inbound.lock().await;
        if let Some(entry) = inbound.remove(transfer_id) {
            for (_, writer) in entry.writers {
                writer.abort().await;
            }
        }
    }

    async fn fail_pending(&self, transfer_id: &str, kind: ErrorKind, detail: &str) {
        self.abort_inbound(transfer_id).await;
        self.registry
            .mark(Side::Pending, transfer_id, TransferStatus::Failed);
        self.registry.remove(Side::Pending, transfer_id);
        self.events.on_error(kind, detail);
    }

    // ---------- outbound dispatch ----------

    async fn send_text(&self, sender: &ConnectionSender, text: String) -> crate::Result<()> {
        sender.send(&Message::Text { content: text }).await?;
        Ok(())
    }

    async fn send_image(
        &self,
        sender: &ConnectionSender,
        image: NormalizedImage,
    ) -> crate::Result<()> {
        sender
            .send(&Message::Image {
                header: ImageHeader {
                    width: image.width,
                    height: image.height,
                    format: image.format,
                },
                payload: image.bytes,
            })
            .await?;
        Ok(())
    }

    async fn send_inline_files(
        &self,
        sender: &ConnectionSender,
        paths: Vec<PathBuf>,
    ) -> crate::Result<()> {
        let Some(paths) = self.prepare_outbound(&paths).await else {
            return Ok(());
        };

        let mut files = Vec::with_capacity(paths.len());
        let mut payload = Vec::new();
        for path in &paths {
            let data = tokio::fs::read(path).await?;
            files.push(FileMetadata {
                name: basename(path),
                size: data.len() as u64,
                checksum: sha256_hex(&data),
                mime_hint: None,
            });
            payload.extend_from_slice(&data);
        }

        info!(files = files.len(), bytes = payload.len(), "sending inline files");
        sender
            .send(&Message::FilesInline {
                header: FilesInlineHeader { files },
                payload,
            })
            .await?;
        Ok(())
    }

    async fn send_announce(
        &self,
        sender: &ConnectionSender,
        paths: Vec<PathBuf>,
    ) -> crate::Result<()> {
        let Some(paths) = self.prepare_outbound(&paths).await else {
            return Ok(());
        };

        // Metadata only: size and streamed digest, never whole files in
        // memory.
        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            let (size, checksum) = file_digest(path).await?;
            files.push(FileMetadata {
                name: basename(path),
                size,
                checksum,
                mime_hint: None,
            });
        }

        let transfer_id = new_transfer_id();
        self.registry
            .register_announced(&transfer_id, files.clone(), paths);

        // One outbound transfer at a time: a newer copy supersedes.
        {
            let mut outbound = self.outbound.lock().await;
            if let Some(prev) = outbound.take() {
                prev.cancel.store(true, Ordering::Relaxed);
                self.registry
                    .mark(Side::Announced, &prev.transfer_id, TransferStatus::Canceled);
                let _ = sender
                    .send(&Message::Cancel(CancelHeader {
                        transfer_id: prev.transfer_id,
                        reason: "superseded by a newer copy".into(),
                    }))
                    .await;
            }
            *outbound = Some(OutboundHandle {
                transfer_id: transfer_id.clone(),
                cancel: Arc::new(AtomicBool::new(false)),
            });
        }

        info!(transfer_id = %transfer_id, files = files.len(), "announcing files");
        sender
            .send(&Message::Announce(AnnounceHeader {
                transfer_id,
                files,
                ttl_secs: self.config.transfer_expiry,
            }))
            .await?;
        Ok(())
    }

    /// Flatten directories, apply the ignore filter, and enforce size
    /// limits. `None` means the send is silently dropped.
    async fn prepare_outbound(&self, paths: &[PathBuf]) -> Option<Vec<PathBuf>> {
        let flattened = flatten_paths(paths).await;
        let kept = self.ignore.filter(&flattened);
        if kept.is_empty() {
            info!("all files ignored by filter; nothing sent");
            return None;
        }

        let mut total = 0u64;
        for path in &kept {
            let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
            if size > self.config.max_file_size {
                info!(
                    file = %path.display(),
                    size,
                    limit = self.config.max_file_size,
                    "file exceeds size limit; send dropped"
                );
                return None;
            }
            total += size;
        }
        if total > self.config.max_total_size {
            info!(
                total,
                limit = self.config.max_total_size,
                "transfer exceeds total size limit; send dropped"
            );
            return None;
        }
        Some(kept)
    }

    // ---------- sender-side chunk streaming ----------

    async fn serve_transfer(
        self: Arc<Self>,
        record: TransferRecord,
        start_offset: u64,
        sender: ConnectionSender,
        cancel: Arc<AtomicBool>,
    ) {
        let transfer_id = record.transfer_id.clone();
        let mut stats = TransferStats::new(record.bytes_total);
        let mut cumulative = 0u64;

        for (index, (meta, path)) in record
            .files
            .iter()
            .zip(record.source_paths.iter())
            .enumerate()
        {
            let file_end = cumulative + meta.size;
            if start_offset >= file_end && meta.size > 0 {
                cumulative = file_end;
                continue;
            }
            let within = start_offset.saturating_sub(cumulative);

            let mut reader = match ChunkedFileReader::open(path, self.config.chunk_size).await {
                Ok(reader) => reader,
                Err(e) => {
                    self.outbound_failed(&transfer_id, &sender, TransferErrorCode::Read, &e)
                        .await;
                    return;
                }
            };
            if within > 0 {
                if let Err(e) = reader.seek_to(within).await {
                    self.outbound_failed(&transfer_id, &sender, TransferErrorCode::Read, &e)
                        .await;
                    return;
                }
            }

            loop {
                // Cancellation is checked between chunks.
                if cancel.load(Ordering::Relaxed) {
                    info!(transfer_id = %transfer_id, "outbound transfer cancelled");
                    self.registry
                        .mark(Side::Announced, &transfer_id, TransferStatus::Canceled);
                    return;
                }
                match reader.next_chunk().await {
                    Ok(Some(chunk)) => {
                        let done = cumulative + chunk.offset + chunk.data.len() as u64;
                        let message = Message::Chunk {
                            header: ChunkHeader {
                                transfer_id: transfer_id.clone(),
                                file_index: index as u32,
                                offset: chunk.offset,
                                length: chunk.data.len() as u32,
                                chunk_checksum: chunk.checksum,
                            },
                            payload: chunk.data,
                        };
                        if sender.send(&message).await.is_err() {
                            self.registry
                                .mark(Side::Announced, &transfer_id, TransferStatus::Failed);
                            return;
                        }
                        self.registry
                            .update_progress(Side::Announced, &transfer_id, done);
                        let (speed, eta) = stats.update(done);
                        self.events.on_progress(
                            &transfer_id,
                            done,
                            record.bytes_total,
                            speed,
                            eta,
                        );
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.outbound_failed(&transfer_id, &sender, TransferErrorCode::Read, &e)
                            .await;
                        return;
                    }
                }
            }
            cumulative = file_end;
        }

        if sender
            .send(&Message::Complete(CompleteHeader {
                transfer_id: transfer_id.clone(),
            }))
            .await
            .is_err()
        {
            self.registry
                .mark(Side::Announced, &transfer_id, TransferStatus::Failed);
            return;
        }
        self.registry
            .mark(Side::Announced, &transfer_id, TransferStatus::Complete);
        info!(transfer_id = %transfer_id, "finished streaming transfer");
    }

    async fn outbound_failed(
        &self,
        transfer_id: &str,
        sender: &ConnectionSender,
        code: TransferErrorCode,
        error: &(dyn std::fmt::Display + Send + Sync),
    ) {
        let detail = error.to_string();
        self.registry
            .mark(Side::Announced, transfer_id, TransferStatus::Failed);
        self.events.on_error(ErrorKind::Internal, &detail);
        let _ = sender
            .send(&Message::TransferError(TransferErrorHeader {
                transfer_id: transfer_id.to_string(),
                code,
                detail,
            }))
            .await;
    }

    // ---------- clipboard install ----------

    /// Install remote content locally with the transient-failure retry,
    /// and arm the echo mask so the watcher does not send it back.
    async fn install(&self, content: &ClipboardContent) {
        self.mask.install(ClipboardSnapshot::capture(content)).await;

        let mut last_err: Option<ClipboardError> = None;
        for attempt in 0..INSTALL_RETRIES {
            let result = match content {
                ClipboardContent::Text(text) => self.adapter.write_text(text).await,
                ClipboardContent::Image(bytes) => self.adapter.write_image(bytes).await,
                ClipboardContent::Files(paths) => self.adapter.write_files(paths).await,
                ClipboardContent::Empty => return,
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < INSTALL_RETRIES {
                        tokio::time::sleep(INSTALL_RETRY_DELAY).await;
                    }
                }
            }
        }
        if let Some(e) = last_err {
            self.events
                .on_error(ErrorKind::ClipboardUnavailable, &e.to_string());
        }
    }

    fn receive_dir(&self, label: &str) -> PathBuf {
        let base = self
            .adapter
            .download_dir()
            .or_else(dirs::download_dir)
            .unwrap_or_else(std::env::temp_dir);
        base.join(format!("yank-{label}"))
    }
}

async fn wait_or_stop(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

/// Folders are flattened: directories expand to the files inside them.
async fn flatten_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = paths.to_vec();
    while let Some(path) = stack.pop() {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            warn!(path = %path.display(), "skipping unreadable path");
            continue;
        };
        if meta.is_dir() {
            let Ok(mut entries) = tokio::fs::read_dir(&path).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                stack.push(entry.path());
            }
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn safe_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base
    }
}

fn transport_error_kind(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::Protocol(_) => ErrorKind::Protocol,
        TransportError::Auth(_) => ErrorKind::Auth,
        TransportError::Connect(_)
        | TransportError::ConnectionLost(_)
        | TransportError::Closed
        | TransportError::HandshakeTimeout => ErrorKind::ConnectionLost,
        TransportError::Io(_) => ErrorKind::ConnectionLost,
    }
}

fn error_kind(error: &crate::Error) -> ErrorKind {
    match error {
        crate::Error::Transport(e) => transport_error_kind(e),
        crate::Error::Auth(_) => ErrorKind::Auth,
        crate::Error::Clipboard(_) => ErrorKind::ClipboardUnavailable,
        crate::Error::Transfer(crate::transfer::TransferError::ChecksumMismatch { .. }) => {
            ErrorKind::ChecksumMismatch
        }
        crate::Error::Transfer(crate::transfer::TransferError::ExpiredOrUnknown(_)) => {
            ErrorKind::ExpiredOrUnknownTransfer
        }
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MockClipboard;
    use crate::sync::events::NullSink;

    #[tokio::test]
    async fn unpaired_store_refuses_to_build() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PairingStore::new(dir.path().join("pairing.json")));
        let result = SyncAgent::new(
            Arc::new(Config::default()),
            store,
            Arc::new(MockClipboard::new()),
            Arc::new(NullSink),
            Arc::new(SyncIgnore::default()),
            AgentOptions::default(),
        );
        assert!(matches!(
            result,
            Err(crate::Error::Auth(AuthError::NotPaired))
        ));
    }

    #[test]
    fn safe_name_strips_traversal() {
        assert_eq!(safe_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_name("notes.txt"), "notes.txt");
        assert_eq!(safe_name(".."), "file");
        assert_eq!(safe_name(""), "file");
    }

    #[tokio::test]
    async fn flatten_expands_directories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(sub.join("b.txt"), b"b").unwrap();

        let flat = flatten_paths(&[dir.path().to_path_buf()]).await;
        let names: Vec<String> = flat.iter().map(|p| basename(p)).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
