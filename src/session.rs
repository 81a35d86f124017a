//! Lepton session and resync controller
//!
//! [`LeptonSession`] owns the transport lifecycle. Opening it connects the
//! bus and starts the streaming pipeline; [`LeptonSession::retrieve_frame`]
//! pulls packets off the queue, classifies them and feeds the frame
//! assembler until a frame completes or the deadline passes.
//!
//! Any structural fault (error flag, bad packet number, broken ordering, or
//! the producer exiting on a transfer error) triggers a resync: the pipeline
//! is stopped, the connection closed, the assembler reset, and after a short
//! backoff the bus is reopened. Recovery happens inside `retrieve_frame`;
//! callers only see an error when the reopen itself fails or the deadline
//! passes.
//!
//! ```text
//! Closed --open--> Open --close--> Closed
//!                  Open --fault--> Resyncing --reopen--> Open
//!                                  Resyncing --reopen fails--> Closed
//! ```

use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::CaptureState;
use crate::config::{ConfigError, SessionConfig};
use crate::frame::FrameImage;
use crate::frame_assembler::{FrameAssembler, FrameProgress};
use crate::packet_validation::{PacketClass, PacketValidator};
use crate::pipeline::{Pipeline, PipelineCounters};
use crate::ring_buffer::RingBuffer;
use crate::transport::{Connection, Transport, TransportError};

/// Errors surfaced to session callers
#[derive(Error, Debug)]
pub enum SessionError {
    /// `open` or `snapshot` called on an open session.
    #[error("session is already open")]
    AlreadyOpen,

    /// `retrieve_frame` called on a closed session.
    #[error("session is not open")]
    NotOpen,

    /// No complete frame arrived before the deadline.
    #[error("no frame within {duration:?}")]
    Timeout {
        /// The deadline that elapsed.
        duration: Duration,
    },

    /// Connecting, reconnecting or closing the bus failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Counters accumulated over the lifetime of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames delivered to the caller
    pub frames: u64,
    /// Close/reopen cycles
    pub resyncs: u64,
    /// `retrieve_frame` calls that hit the deadline
    pub timeouts: u64,
    /// Bus transfers completed
    pub transfers: u64,
    /// Packets read off the bus, padding included
    pub packets: u64,
    /// Padding packets dropped by the pipeline
    pub padding_discarded: u64,
    /// Blank packets dropped by the validator
    pub blank_discarded: u64,
    /// Packets rejected by the validator
    pub packet_faults: u64,
    /// Packets rejected by the frame assembler
    pub sequence_faults: u64,
    /// Ring chunks replaced while still referenced
    pub recycle_misses: u64,
}

/// A Lepton 3 VoSPI session over transport `T`
pub struct LeptonSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    validator: PacketValidator,
    assembler: FrameAssembler,
    pipeline: Option<Pipeline<T::Connection>>,
    /// Ring kept across pipelines so a resync does not reallocate it
    ring: Option<RingBuffer>,
    capture: Option<Arc<CaptureState>>,
    counters: Arc<PipelineCounters>,
    stats: SessionStats,
}

impl<T: Transport> LeptonSession<T> {
    /// Create a closed session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if `config` fails validation.
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let validator = if config.verify_crc {
            PacketValidator::with_crc()
        } else {
            PacketValidator::new()
        };

        Ok(Self {
            transport,
            config,
            validator,
            assembler: FrameAssembler::new(),
            pipeline: None,
            ring: None,
            capture: None,
            counters: Arc::new(PipelineCounters::default()),
            stats: SessionStats::default(),
        })
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether the bus is connected and streaming
    pub fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Connect the bus and start streaming.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyOpen`] if the session is open;
    /// [`SessionError::Transport`] if the bus cannot be opened.
    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(SessionError::AlreadyOpen);
        }
        self.assembler.reset();
        self.start_pipeline()?;
        log::info!(
            "Lepton session opened at {} Hz ({:?})",
            self.config.bus.speed_hz,
            self.config.bus.mode
        );
        Ok(())
    }

    /// Stop streaming and release the bus. Closing a closed session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] if the connection fails to close.
    /// The session is closed either way.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.stop_pipeline()?;
        log::info!("Lepton session closed");
        Ok(())
    }

    /// Block until a complete frame has been written into `dest`.
    ///
    /// Structural faults are recovered from internally by resyncing. The
    /// deadline covers the whole call, resyncs included.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotOpen`] if the session is closed.
    /// - [`SessionError::Timeout`] if no frame completed in time. The
    ///   session stays open and no resync is performed.
    /// - [`SessionError::Transport`] if reopening during a resync fails.
    ///   The session is closed afterwards.
    pub fn retrieve_frame(&mut self, dest: &mut FrameImage) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }

        self.assembler.reset();
        let timeout = self.config.frame_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out(timeout));
            }
            let Some(pipeline) = self.pipeline.as_ref() else {
                return Err(SessionError::NotOpen);
            };

            let packet = match pipeline.recv_timeout(remaining) {
                Ok(packet) => packet,
                Err(RecvTimeoutError::Timeout) => return Err(self.timed_out(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("Streaming thread exited, resyncing");
                    self.resync()?;
                    continue;
                }
            };

            let packet_num = match self.validator.classify(&packet) {
                PacketClass::Discard => {
                    self.stats.blank_discarded += 1;
                    continue;
                }
                PacketClass::Fatal(fault) => {
                    self.stats.packet_faults += 1;
                    log::debug!("Packet fault: {}", fault);
                    drop(packet);
                    self.resync()?;
                    continue;
                }
                PacketClass::Sequence(packet_num) => packet_num,
            };

            match self.assembler.accept(packet_num, &packet) {
                Ok(FrameProgress::Incomplete) => {}
                Ok(FrameProgress::Complete) => {
                    self.assembler.write_image(dest);
                    self.stats.frames += 1;
                    if let Some(capture) = &self.capture {
                        capture.record_frame();
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.stats.sequence_faults += 1;
                    log::debug!("Sequence fault: {}", e);
                    drop(packet);
                    self.resync()?;
                }
            }
        }
    }

    /// Open, retrieve one frame and close.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyOpen`] if the session is already open, leaving
    /// it untouched. Otherwise any error from [`open`](Self::open),
    /// [`retrieve_frame`](Self::retrieve_frame) or [`close`](Self::close).
    pub fn snapshot(&mut self) -> Result<FrameImage> {
        if self.is_open() {
            return Err(SessionError::AlreadyOpen);
        }

        self.open()?;
        let mut image = FrameImage::new();
        let retrieved = self.retrieve_frame(&mut image);
        let closed = self.close();
        retrieved?;
        closed?;
        Ok(image)
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            transfers: self.counters.transfers.load(Ordering::Relaxed),
            packets: self.counters.packets.load(Ordering::Relaxed),
            padding_discarded: self.counters.padding.load(Ordering::Relaxed),
            recycle_misses: self.counters.recycle_misses.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    /// Record every bus transfer into `capture`.
    ///
    /// Takes effect from the next connect, so attach before
    /// [`open`](Self::open). Only transfers made while the capture is
    /// active are kept.
    pub fn attach_capture(&mut self, capture: Arc<CaptureState>) {
        if self.is_open() {
            log::debug!("Capture attached to an open session; recording starts after the next reconnect");
        }
        self.capture = Some(capture);
    }

    /// Stop recording into the attached capture, if any.
    pub fn detach_capture(&mut self) -> Option<Arc<CaptureState>> {
        self.capture.take()
    }

    fn timed_out(&mut self, timeout: Duration) -> SessionError {
        self.stats.timeouts += 1;
        log::warn!("No frame within {:?}", timeout);
        SessionError::Timeout { duration: timeout }
    }

    fn start_pipeline(&mut self) -> Result<()> {
        let connection = self.transport.connect(&self.config.bus)?;
        let ring = self.ring.take().unwrap_or_else(|| {
            RingBuffer::for_transfers(
                self.config.packets_per_transfer,
                self.config.max_packets_per_frame,
            )
        });

        self.pipeline = Some(Pipeline::start(
            connection,
            ring,
            self.config.queue_capacity,
            self.config.discard_mask,
            self.capture.clone(),
            Arc::clone(&self.counters),
        ));
        Ok(())
    }

    fn stop_pipeline(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        let Some(exit) = pipeline.stop() else {
            return Ok(());
        };

        self.ring = Some(exit.ring);
        if let Some(e) = exit.error {
            log::warn!("Streaming ended with transfer error: {}", e);
        }
        exit.connection.close()?;
        Ok(())
    }

    fn resync(&mut self) -> Result<()> {
        self.stats.resyncs += 1;
        log::warn!("Resyncing VoSPI stream (#{})", self.stats.resyncs);

        if let Err(e) = self.stop_pipeline() {
            log::warn!("Failed to close connection during resync: {}", e);
        }
        self.assembler.reset();
        std::thread::sleep(self.config.resync_backoff());

        if let Err(e) = self.start_pipeline() {
            log::error!("Reopen after resync failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

impl<T: Transport> Drop for LeptonSession<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close session on drop: {}", e);
        }
    }
}

impl<T: Transport> std::fmt::Debug for LeptonSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeptonSession")
            .field("open", &self.is_open())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
