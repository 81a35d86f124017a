//! Frame assembly from VoSPI packets
//!
//! A Lepton 3 frame is sent as 4 segments of 60 packets. Each packet carries
//! half an image row. Packet 20 of each segment carries the segment number
//! (1-4) in the leading nibble of its ID word; a segment number of 0 means
//! the camera is re-sending and the segment must not advance state.
//!
//! The assembler copies each payload into a reusable segment buffer and, on
//! packet 59, bulk-copies the finished segment into the frame buffer. Both
//! buffers are allocated once, so steady-state assembly never allocates and
//! never holds on to transfer chunks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lepton_vospi::frame_assembler::{FrameAssembler, FrameProgress};
//! use lepton_vospi::FrameImage;
//!
//! let mut assembler = FrameAssembler::new();
//! let mut image = FrameImage::new();
//!
//! for packet in packets {
//!     let packet_num = packet.header().packet_number();
//!     match assembler.accept(packet_num, &packet)? {
//!         FrameProgress::Complete => assembler.write_image(&mut image),
//!         FrameProgress::Incomplete => {}
//!     }
//! }
//! ```

use thiserror::Error;

use crate::frame::FrameImage;
use crate::packet::{
    FRAME_WIDTH, HEADER_SIZE, MAX_PACKET_NUMBER, PACKETS_PER_FRAME, PACKETS_PER_SEGMENT,
    PACKET_SIZE, PAYLOAD_SIZE, PIXELS_PER_PACKET, SEGMENTS_PER_FRAME, SEGMENT_NUMBER_PACKET,
};

/// Payload bytes of one packet
type Payload = [u8; PAYLOAD_SIZE];

/// Result of feeding one packet to the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    /// More packets are needed
    Incomplete,
    /// The fourth segment finished; the frame can be written out
    Complete,
}

/// Structural reassembly errors; the stream must be resynchronised
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// Packet number did not follow the previous one.
    #[error("out of order packet: {last:?} -> {received}")]
    OutOfOrderPacket {
        /// Last accepted packet number (`None` after reset).
        last: Option<u16>,
        /// Packet number received.
        received: u16,
    },

    /// Packet number is beyond the end of a segment.
    #[error("invalid packet number: {0}")]
    InvalidPacketNumber(u16),

    /// Segment number on packet 20 is beyond the last segment.
    #[error("invalid segment number: {0}")]
    InvalidSegment(u8),

    /// Segment number on packet 20 skipped or repeated a segment.
    #[error("out of order segment: {current} -> {received}")]
    OutOfOrderSegment {
        /// Segment currently being assembled.
        current: u8,
        /// Segment number received.
        received: u8,
    },

    /// Packet slice is shorter than a VoSPI packet.
    #[error("packet too short for reassembly: {len} bytes")]
    ShortPacket {
        /// Actual slice length.
        len: usize,
    },
}

/// Reassembles validated packets into complete frames
pub struct FrameAssembler {
    /// Last accepted packet number; `None` means packet 0 is expected next
    last_packet: Option<u16>,
    /// Segment currently being assembled (0 = not yet known)
    segment: u8,
    /// Payloads of the segment in progress
    segment_packets: Box<[Payload]>,
    /// Payloads of all completed segments of the frame
    frame_packets: Box<[Payload]>,
}

impl FrameAssembler {
    /// Create an assembler with its buffers allocated up front
    pub fn new() -> Self {
        Self {
            last_packet: None,
            segment: 0,
            segment_packets: vec![[0u8; PAYLOAD_SIZE]; PACKETS_PER_SEGMENT].into_boxed_slice(),
            frame_packets: vec![[0u8; PAYLOAD_SIZE]; PACKETS_PER_FRAME].into_boxed_slice(),
        }
    }

    /// Reset the sequence state without touching the buffers
    pub fn reset(&mut self) {
        self.last_packet = None;
        self.segment = 0;
    }

    /// Last accepted packet number
    pub fn last_packet(&self) -> Option<u16> {
        self.last_packet
    }

    /// Segment currently being assembled (0 before packet 20 of segment 1)
    pub fn segment(&self) -> u8 {
        self.segment
    }

    /// Feed one validated packet.
    ///
    /// `packet` is the full VoSPI packet, header included; the segment number
    /// is read from its ID word on packet 20.
    ///
    /// # Errors
    ///
    /// Returns a [`SequenceError`] when the packet breaks packet or segment
    /// ordering. The assembler state is left as it was before the call for
    /// out-of-order packets; the caller is expected to [`reset`](Self::reset)
    /// after any error.
    pub fn accept(&mut self, packet_num: u16, packet: &[u8]) -> Result<FrameProgress, SequenceError> {
        if packet.len() < PACKET_SIZE {
            return Err(SequenceError::ShortPacket { len: packet.len() });
        }
        if packet_num > MAX_PACKET_NUMBER {
            return Err(SequenceError::InvalidPacketNumber(packet_num));
        }
        if !self.is_sequential(packet_num) {
            return Err(SequenceError::OutOfOrderPacket {
                last: self.last_packet,
                received: packet_num,
            });
        }

        let index = usize::from(packet_num);
        self.segment_packets[index].copy_from_slice(&packet[HEADER_SIZE..PACKET_SIZE]);

        let mut progress = FrameProgress::Incomplete;
        match packet_num {
            SEGMENT_NUMBER_PACKET => {
                let segment = packet[0] >> 4;
                if usize::from(segment) > SEGMENTS_PER_FRAME {
                    return Err(SequenceError::InvalidSegment(segment));
                }
                if segment > 0 && segment != self.segment + 1 {
                    return Err(SequenceError::OutOfOrderSegment {
                        current: self.segment,
                        received: segment,
                    });
                }
                if segment > 0 {
                    self.segment = segment;
                }
            }
            MAX_PACKET_NUMBER => {
                if self.segment > 0 {
                    let start = usize::from(self.segment - 1) * PACKETS_PER_SEGMENT;
                    self.frame_packets[start..start + PACKETS_PER_SEGMENT]
                        .copy_from_slice(&self.segment_packets);
                }
                if usize::from(self.segment) == SEGMENTS_PER_FRAME {
                    progress = FrameProgress::Complete;
                }
            }
            _ => {}
        }

        self.last_packet = Some(packet_num);
        Ok(progress)
    }

    /// Write the assembled frame into `image`.
    ///
    /// Packet slot `k` fills row `k / 2`; even slots fill the left half of the
    /// row, odd slots the right half. Pixels are big-endian on the wire.
    pub fn write_image(&self, image: &mut FrameImage) {
        let pixels = image.pixels_mut();
        for (slot, payload) in self.frame_packets.iter().enumerate() {
            let row = slot / 2;
            let col = (slot % 2) * PIXELS_PER_PACKET;
            let start = row * FRAME_WIDTH + col;
            let dest = &mut pixels[start..start + PIXELS_PER_PACKET];
            for (pixel, bytes) in dest.iter_mut().zip(payload.chunks_exact(2)) {
                *pixel = u16::from_be_bytes([bytes[0], bytes[1]]);
            }
        }
    }

    fn is_sequential(&self, packet_num: u16) -> bool {
        match self.last_packet {
            None => packet_num == 0,
            Some(MAX_PACKET_NUMBER) => packet_num == 0,
            Some(last) => packet_num == last + 1,
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("last_packet", &self.last_packet)
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}
