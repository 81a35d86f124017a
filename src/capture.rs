//! Raw transfer capture for offline debugging.
//!
//! Records every bus transfer the streaming pipeline performs, exactly as it
//! came off the wire (padding included), so a session can be replayed later
//! through [`ReplayTransport`](crate::replay::ReplayTransport) without
//! hardware.
//!
//! # File Format
//!
//! A capture is a directory holding two files:
//! - `packets.bin`: Sequence of `[u32 LE: length][bytes: transfer]...`
//! - `metadata.json`: [`CaptureMetadata`]
//!
//! # Example
//!
//! ```ignore
//! let capture = Arc::new(CaptureState::new());
//! capture.start_capture(CaptureMetadata::default())?;
//! session.attach_capture(Arc::clone(&capture));
//!
//! session.retrieve_frame(&mut image)?;
//!
//! let result = capture.stop_capture(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::packet::PACKET_SIZE;

/// File name of the transfer stream inside a capture directory
pub const PACKETS_FILE: &str = "packets.bin";
/// File name of the metadata inside a capture directory
pub const METADATA_FILE: &str = "metadata.json";

/// Largest transfer accepted when reading a capture back
pub const MAX_TRANSFER_LEN: usize = 1024 * 1024;

/// Errors that can occur during capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// A length prefix in `packets.bin` is out of range or truncated.
    #[error("corrupt transfer record at offset {offset}: {message}")]
    Corrupt {
        /// Byte offset of the record.
        offset: u64,
        /// Description of the problem.
        message: String,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about a capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Bus clock the capture was taken at.
    #[serde(default)]
    pub bus_speed_hz: u32,
    /// Size of one VoSPI packet in bytes.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Number of bus transfers recorded.
    #[serde(default)]
    pub total_transfers: u64,
    /// Number of packets recorded, padding included.
    #[serde(default)]
    pub total_packets: u64,
    /// Number of frames decoded while capturing.
    #[serde(default)]
    pub total_frames: u64,
    /// Total bytes recorded.
    #[serde(default)]
    pub total_bytes: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

fn default_packet_size() -> usize {
    PACKET_SIZE
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved `packets.bin`.
    pub packets_path: PathBuf,
    /// Path to the saved `metadata.json`.
    pub metadata_path: PathBuf,
    /// Summary of the capture.
    pub metadata: CaptureMetadata,
}

/// Thread-safe transfer recorder.
///
/// Shared between the caller, who starts and stops it, and the streaming
/// thread, which records into it.
pub struct CaptureState {
    is_capturing: AtomicBool,
    transfers: Mutex<Vec<Vec<u8>>>,
    start_time: Mutex<Option<Instant>>,
    metadata: Mutex<CaptureMetadata>,
    /// Fast path counters for the streaming thread
    transfer_count: AtomicU64,
    byte_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            transfers: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            transfer_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Number of transfers recorded so far.
    #[must_use]
    pub fn transfer_count(&self) -> u64 {
        self.transfer_count.load(Ordering::Relaxed)
    }

    /// Number of bytes recorded so far.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture, discarding anything recorded before.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    /// Returns `CaptureError::LockError` if the internal mutex cannot be acquired.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        lock(&self.transfers)?.clear();
        self.transfer_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        *lock(&self.start_time)? = Some(Instant::now());
        *lock(&self.metadata)? = metadata;

        log::info!("Transfer capture started");
        Ok(())
    }

    /// Records one bus transfer. Ignored unless a capture is active.
    pub fn record_transfer(&self, transfer: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        self.transfer_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(transfer.len() as u64, Ordering::Relaxed);

        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.push(transfer.to_vec());
        } else {
            log::warn!("Failed to acquire lock for transfer recording");
        }
    }

    /// Counts one decoded frame in the metadata.
    pub fn record_frame(&self) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        if let Ok(mut meta) = self.metadata.lock() {
            meta.total_frames += 1;
        }
    }

    /// Stops the capture and writes it into `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = lock(&self.start_time)?
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let transfers = std::mem::take(&mut *lock(&self.transfers)?);
        let metadata = {
            let mut meta = lock(&self.metadata)?;
            meta.duration_ms = duration_ms;
            meta.clone()
        };

        let result = write_capture(output_dir, &transfers, metadata)?;

        log::info!(
            "Capture stopped: {} transfers, {} packets, {} bytes, {} ms",
            result.metadata.total_transfers,
            result.metadata.total_packets,
            result.metadata.total_bytes,
            duration_ms
        );

        Ok(result)
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.clear();
        }
        log::info!("Capture cancelled");
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureState")
            .field("is_capturing", &self.is_capturing())
            .field("transfer_count", &self.transfer_count())
            .field("byte_count", &self.byte_count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| CaptureError::LockError(e.to_string()))
}

/// Write `transfers` as a capture directory.
///
/// The transfer, packet and byte totals in `metadata` are recomputed from
/// `transfers`; the remaining fields are kept.
///
/// # Errors
///
/// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
pub fn write_capture(
    output_dir: &Path,
    transfers: &[Vec<u8>],
    mut metadata: CaptureMetadata,
) -> Result<CaptureResult> {
    let total_bytes: usize = transfers.iter().map(Vec::len).sum();
    metadata.packet_size = PACKET_SIZE;
    metadata.total_transfers = transfers.len() as u64;
    metadata.total_bytes = total_bytes as u64;
    metadata.total_packets = (total_bytes / PACKET_SIZE) as u64;

    let packets_path = output_dir.join(PACKETS_FILE);
    let mut file = BufWriter::new(std::fs::File::create(&packets_path)?);
    for transfer in transfers {
        let len = transfer.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(transfer)?;
    }
    file.flush()?;
    log::debug!(
        "Saved {} transfers to {}",
        transfers.len(),
        packets_path.display()
    );

    let metadata_path = output_dir.join(METADATA_FILE);
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;
    log::debug!("Saved metadata to {}", metadata_path.display());

    Ok(CaptureResult {
        packets_path,
        metadata_path,
        metadata,
    })
}

/// Reads every transfer from a `packets.bin` file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read and
/// `CaptureError::Corrupt` if a record is oversized or truncated.
pub fn read_transfers(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut transfers = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CaptureError::Io(e)),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_TRANSFER_LEN {
            return Err(CaptureError::Corrupt {
                offset,
                message: format!("transfer length {} exceeds 1MB limit", len),
            });
        }

        let mut transfer = vec![0u8; len];
        file.read_exact(&mut transfer)
            .map_err(|_| CaptureError::Corrupt {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        transfers.push(transfer);
        offset += 4 + len as u64;
    }

    Ok(transfers)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
