//! Capture replay for testing without physical hardware.
//!
//! [`ReplayTransport`] implements [`Transport`] over a capture written by
//! [`crate::capture`], so a recorded stream can be pushed through a normal
//! [`LeptonSession`](crate::session::LeptonSession), resyncs included.
//! Transfer boundaries of the recording are not preserved: the capture is
//! flattened into one packet stream and re-chunked at whatever transfer size
//! the replaying session uses.
//!
//! The playback position survives reconnects, so a resync picks up where
//! the stream left off, as it would on a live camera. At the end of the
//! recording the transport either loops or clocks out padding forever.
//!
//! [`CaptureFrames`] decodes a capture offline without a session.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use lepton_vospi::replay::ReplayTransport;
//!
//! let transport = ReplayTransport::load(Path::new("captures/bench"))?;
//! let mut session = LeptonSession::new(transport, SessionConfig::default())?;
//! let image = session.snapshot()?;
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{
    read_metadata, read_transfers, CaptureError, CaptureMetadata, METADATA_FILE, PACKETS_FILE,
};
use crate::frame::FrameImage;
use crate::frame_assembler::{FrameAssembler, FrameProgress};
use crate::packet::{is_padding, DEFAULT_DISCARD_MASK, PACKET_SIZE};
use crate::packet_validation::{PacketClass, PacketValidator};
use crate::transport::{self, BusSettings, Connection, Transport};

/// Errors that can occur when loading a capture for replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Reading the capture failed.
    #[error("failed to read capture: {0}")]
    Capture(#[from] CaptureError),

    /// The capture holds no whole packet.
    #[error("capture contains no packets")]
    Empty,

    /// The capture was recorded with a different packet size.
    #[error("capture packet size {0} does not match VoSPI packet size")]
    PacketSize(usize),
}

/// Pause after a transfer that found the recording exhausted
const IDLE_DELAY: Duration = Duration::from_millis(1);

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Restart from the beginning at the end of the recording.
    pub loop_playback: bool,
    /// Pause before every transfer (zero = as fast as possible).
    pub transfer_delay: Duration,
}

/// Replays a recorded packet stream as a bus transport.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    stream: Arc<[u8]>,
    metadata: Option<CaptureMetadata>,
    config: ReplayConfig,
    /// Playback position shared with the live connection
    cursor: Arc<AtomicUsize>,
}

impl ReplayTransport {
    /// Load the capture in directory `dir`.
    ///
    /// `metadata.json` is optional; `packets.bin` is required.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Capture` if the capture cannot be read,
    /// `ReplayError::PacketSize` if the metadata declares a foreign packet
    /// size and `ReplayError::Empty` if it holds no whole packet.
    pub fn load(dir: &Path) -> Result<Self> {
        let transfers = read_transfers(&dir.join(PACKETS_FILE))?;

        let metadata_path = dir.join(METADATA_FILE);
        let metadata = if metadata_path.exists() {
            Some(read_metadata(&metadata_path)?)
        } else {
            None
        };

        if let Some(meta) = &metadata {
            if meta.packet_size != PACKET_SIZE {
                return Err(ReplayError::PacketSize(meta.packet_size));
            }
            log::info!(
                "Capture metadata: {} transfers, {} frames, {} ms at {} Hz",
                meta.total_transfers,
                meta.total_frames,
                meta.duration_ms,
                meta.bus_speed_hz
            );
        }

        let mut replay = Self::from_transfers(&transfers)?;
        replay.metadata = metadata;
        log::info!(
            "Loaded {} packets from {}",
            replay.packet_count(),
            dir.display()
        );
        Ok(replay)
    }

    /// Replay in-memory transfers.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Empty` if the transfers hold no whole packet.
    pub fn from_transfers(transfers: &[Vec<u8>]) -> Result<Self> {
        let mut stream = transfers.concat();
        let whole = stream.len() / PACKET_SIZE * PACKET_SIZE;
        if whole != stream.len() {
            log::warn!(
                "Dropping {} trailing bytes of a partial packet",
                stream.len() - whole
            );
            stream.truncate(whole);
        }
        if stream.is_empty() {
            return Err(ReplayError::Empty);
        }

        Ok(Self {
            stream: Arc::from(stream),
            metadata: None,
            config: ReplayConfig::default(),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replace the replay configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Metadata loaded alongside the capture, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Number of recorded packets.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.stream.len() / PACKET_SIZE
    }

    /// Packets already played.
    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire) / PACKET_SIZE
    }

    /// Rewind to the first packet.
    pub fn rewind(&self) {
        self.cursor.store(0, Ordering::Release);
    }
}

impl Transport for ReplayTransport {
    type Connection = ReplayConnection;

    fn connect(&mut self, _settings: &BusSettings) -> transport::Result<ReplayConnection> {
        log::debug!("Replay connect at packet {}", self.position());
        Ok(ReplayConnection {
            stream: Arc::clone(&self.stream),
            cursor: Arc::clone(&self.cursor),
            config: self.config.clone(),
            reported_end: false,
        })
    }
}

/// A connection reading from a [`ReplayTransport`]
#[derive(Debug)]
pub struct ReplayConnection {
    stream: Arc<[u8]>,
    cursor: Arc<AtomicUsize>,
    config: ReplayConfig,
    reported_end: bool,
}

impl Connection for ReplayConnection {
    fn transfer(&mut self, rx: &mut [u8]) -> transport::Result<()> {
        if !self.config.transfer_delay.is_zero() {
            std::thread::sleep(self.config.transfer_delay);
        }

        let mut cursor = self.cursor.load(Ordering::Acquire);
        let mut idle = true;
        for slot in rx.chunks_mut(PACKET_SIZE) {
            if cursor >= self.stream.len() && self.config.loop_playback {
                log::debug!("Replay loop completed, restarting");
                cursor = 0;
            }
            if cursor < self.stream.len() {
                let end = (cursor + slot.len()).min(self.stream.len());
                let n = end - cursor;
                slot[..n].copy_from_slice(&self.stream[cursor..end]);
                slot[n..].fill(0);
                cursor = end;
                idle = false;
            } else {
                if !self.reported_end {
                    log::info!("Replay reached end of capture");
                    self.reported_end = true;
                }
                write_padding(slot);
            }
        }
        self.cursor.store(cursor, Ordering::Release);

        // Idle camera: don't spin the streaming thread
        if idle {
            std::thread::sleep(IDLE_DELAY);
        }
        Ok(())
    }

    fn close(self) -> transport::Result<()> {
        Ok(())
    }
}

fn write_padding(slot: &mut [u8]) {
    slot.fill(0);
    if let Some(first) = slot.first_mut() {
        *first = DEFAULT_DISCARD_MASK;
    }
}

/// Iterator over the frames of a capture, decoded offline
///
/// Faults reset the assembler instead of resyncing; decoding simply carries
/// on at the next packet 0.
pub struct CaptureFrames {
    stream: Arc<[u8]>,
    offset: usize,
    validator: PacketValidator,
    assembler: FrameAssembler,
    discard_mask: u8,
}

impl CaptureFrames {
    /// Decode the capture in directory `dir`.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the capture cannot be loaded.
    pub fn new(dir: &Path) -> Result<Self> {
        let replay = ReplayTransport::load(dir)?;
        Ok(Self::from_replay(&replay))
    }

    /// Decode the stream of an already loaded replay.
    pub fn from_replay(replay: &ReplayTransport) -> Self {
        Self {
            stream: Arc::clone(&replay.stream),
            offset: 0,
            validator: PacketValidator::new(),
            assembler: FrameAssembler::new(),
            discard_mask: DEFAULT_DISCARD_MASK,
        }
    }

    /// Check CRCs while decoding.
    #[must_use]
    pub fn with_crc(mut self) -> Self {
        self.validator = PacketValidator::with_crc();
        self
    }
}

impl Iterator for CaptureFrames {
    type Item = FrameImage;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset + PACKET_SIZE <= self.stream.len() {
            let packet = &self.stream[self.offset..self.offset + PACKET_SIZE];
            self.offset += PACKET_SIZE;

            if is_padding(packet, self.discard_mask) {
                continue;
            }
            let packet_num = match self.validator.classify(packet) {
                PacketClass::Sequence(n) => n,
                PacketClass::Discard => continue,
                PacketClass::Fatal(fault) => {
                    log::debug!("Skipping faulty packet: {}", fault);
                    self.assembler.reset();
                    continue;
                }
            };

            match self.assembler.accept(packet_num, packet) {
                Ok(FrameProgress::Complete) => {
                    let mut image = FrameImage::new();
                    self.assembler.write_image(&mut image);
                    self.assembler.reset();
                    return Some(image);
                }
                Ok(FrameProgress::Incomplete) => {}
                Err(e) => {
                    log::debug!("Sequence fault in capture: {}", e);
                    self.assembler.reset();
                }
            }
        }
        None
    }
}
