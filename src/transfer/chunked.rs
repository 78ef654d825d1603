//! Chunked file reader/writer
//!
//! The reader streams a source file in fixed-size chunks, one chunk in
//! memory at a time, each carrying its own SHA-256. The writer lands
//! chunks in a sibling `<name>.part` file at their stated offsets and
//! atomically renames into place once the full-content checksum checks
//! out, suffixing ` (2)`, ` (3)`, ... on name collisions.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info};

use super::TransferError;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// One chunk read from a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChunk {
    pub offset: u64,
    pub data: Vec<u8>,
    /// SHA-256 over this chunk's bytes, hex
    pub checksum: String,
}

/// SHA-256 of an in-memory buffer, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streamed SHA-256 and size of a file, without loading it whole.
pub async fn file_digest(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// Reads a file as a sequence of fixed-size chunks.
pub struct ChunkedFileReader {
    file: File,
    chunk_size: usize,
    file_size: u64,
    offset: u64,
}

impl ChunkedFileReader {
    pub async fn open(path: &Path, chunk_size: u64) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1) as usize,
            file_size,
            offset: 0,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of chunks a full read will produce.
    pub fn total_chunks(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size as u64)
    }

    /// Rewind or fast-forward; the next chunk starts at `offset`.
    pub async fn seek_to(&mut self, offset: u64) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        Ok(())
    }

    /// Read the next chunk, or `None` at end of file. Never buffers more
    /// than one chunk.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<FileChunk>> {
        if self.offset >= self.file_size {
            return Ok(None);
        }
        let want = (self.chunk_size as u64).min(self.file_size - self.offset) as usize;
        let mut data = vec![0u8; want];
        self.file.read_exact(&mut data).await?;

        let chunk = FileChunk {
            offset: self.offset,
            checksum: sha256_hex(&data),
            data,
        };
        self.offset += want as u64;
        Ok(Some(chunk))
    }
}

/// Writes chunks into `<dest>.part`, finalizing with verification and an
/// atomic rename.
pub struct ChunkedFileWriter {
    dest: PathBuf,
    part: PathBuf,
    expected_size: u64,
    expected_checksum: String,
    file: Option<File>,
    bytes_written: u64,
}

impl ChunkedFileWriter {
    pub async fn create(
        dest_dir: &Path,
        name: &str,
        expected_size: u64,
        expected_checksum: &str,
    ) -> Result<Self, TransferError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(name);
        let part = dest_dir.join(format!("{name}.part"));
        let file = File::create(&part).await?;
        Ok(Self {
            dest,
            part,
            expected_size,
            expected_checksum: expected_checksum.to_string(),
            file: Some(file),
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.expected_size
    }

    /// Verify and write one chunk at its stated offset.
    pub async fn write_chunk(
        &mut self,
        offset: u64,
        data: &[u8],
        chunk_checksum: &str,
    ) -> Result<(), TransferError> {
        if sha256_hex(data) != chunk_checksum {
            return Err(TransferError::ChecksumMismatch {
                name: format!("{} (chunk at offset {offset})", display_name(&self.dest)),
            });
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::Cancelled("writer already finalized".into()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        let end = offset + data.len() as u64;
        if end > self.bytes_written {
            self.bytes_written = end;
        }
        Ok(())
    }

    /// Verify the full content hash and atomically rename into place.
    /// On mismatch the temp file is deleted.
    pub async fn finalize(mut self) -> Result<PathBuf, TransferError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let actual_size = tokio::fs::metadata(&self.part).await?.len();
        if actual_size != self.expected_size {
            self.cleanup().await;
            return Err(TransferError::ChecksumMismatch {
                name: format!(
                    "{} (size {actual_size}, expected {})",
                    display_name(&self.dest),
                    self.expected_size
                ),
            });
        }

        let (_, actual_checksum) = file_digest(&self.part).await?;
        if actual_checksum != self.expected_checksum {
            self.cleanup().await;
            return Err(TransferError::ChecksumMismatch {
                name: display_name(&self.dest),
            });
        }

        let final_path = unique_path(&self.dest).await;
        tokio::fs::rename(&self.part, &final_path).await?;
        info!(path = %final_path.display(), "file finalized");
        Ok(final_path)
    }

    /// Drop the temp file (cancellation or error path).
    pub async fn abort(mut self) {
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        self.file.take();
        if tokio::fs::remove_file(&self.part).await.is_ok() {
            debug!(path = %self.part.display(), "removed partial file");
        }
    }
}

fn display_name(path: &Path) -> String {
    crate::clipboard::basename(path)
}

/// Collision policy: `name.ext`, `name (2).ext`, `name (3).ext`, ...
async fn unique_path(path: &Path) -> PathBuf {
    if !matches!(tokio::fs::try_exists(path).await, Ok(true)) {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().to_string());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    for n in 2u32.. {
        let candidate = match &extension {
            Some(ext) => parent.join(format!("{stem} ({n}).{ext}")),
            None => parent.join(format!("{stem} ({n})")),
        };
        if !matches!(tokio::fs::try_exists(&candidate).await, Ok(true)) {
            return candidate;
        }
    }
    unreachable!("u32 range exhausted probing for a free filename")
}

/// Rolling transfer statistics: speed as an EMA over a two-second
/// window, ETA from the smoothed speed.
pub struct TransferStats {
    bytes_total: u64,
    bytes_done: u64,
    speed_bps: f64,
    last_update: Instant,
}

const EMA_WINDOW: Duration = Duration::from_secs(2);

impl TransferStats {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            bytes_total,
            bytes_done: 0,
            speed_bps: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Record progress; returns `(speed_bps, eta_seconds)`.
    pub fn update(&mut self, bytes_done: u64) -> (f64, f64) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f64();
        let delta = bytes_done.saturating_sub(self.bytes_done) as f64;

        if dt > 0.0 {
            let instant_bps = delta / dt;
            let alpha = (dt / EMA_WINDOW.as_secs_f64()).min(1.0);
            self.speed_bps = self.speed_bps * (1.0 - alpha) + instant_bps * alpha;
        }
        self.bytes_done = bytes_done;
        self.last_update = now;

        let remaining = self.bytes_total.saturating_sub(bytes_done) as f64;
        let eta = remaining / self.speed_bps.max(1.0);
        (self.speed_bps, eta)
    }

    pub fn speed_bps(&self) -> f64 {
        self.speed_bps
    }
}

/// Format a byte count for log lines.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
