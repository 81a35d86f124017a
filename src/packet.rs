//! VoSPI packet layout and packet views
//!
//! A VoSPI packet is 164 bytes:
//!
//! ```text
//! +--------+--------+--------+--------+------------------------+
//! | ID hi  | ID lo  | CRC hi | CRC lo | payload (160 bytes)    |
//! +--------+--------+--------+--------+------------------------+
//! ```
//!
//! The 16-bit ID word carries:
//! - Bit 15: error flag, set by the camera when it lost framing
//! - Bits 12-14: segment number, only meaningful on packet 20
//! - Bits 0-11: packet number within the segment (0-59)
//!
//! Idle and padding packets have the low nibble of the first ID byte set
//! (`xF` in the top byte), which the streaming pipeline filters out early.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Size of the ID and CRC words at the start of each packet
pub const HEADER_SIZE: usize = 4;
/// Size of the pixel payload of each packet
pub const PAYLOAD_SIZE: usize = 160;
/// Total size of one VoSPI packet
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Frame width in pixels
pub const FRAME_WIDTH: usize = 160;
/// Frame height in pixels
pub const FRAME_HEIGHT: usize = 120;
/// Pixels carried by one packet (half a row)
pub const PIXELS_PER_PACKET: usize = PAYLOAD_SIZE / 2;
/// Packets in one segment
pub const PACKETS_PER_SEGMENT: usize = 60;
/// Segments in one frame
pub const SEGMENTS_PER_FRAME: usize = 4;
/// Packets in one frame, excluding discards
pub const PACKETS_PER_FRAME: usize = SEGMENTS_PER_FRAME * PACKETS_PER_SEGMENT;

/// Packet whose ID word carries the segment number
pub const SEGMENT_NUMBER_PACKET: u16 = 20;
/// Highest valid packet number
pub const MAX_PACKET_NUMBER: u16 = 59;

/// Error flag in the ID word
pub const ERROR_FLAG: u16 = 0x8000;
/// Packet number bits in the ID word
pub const PACKET_NUMBER_MASK: u16 = 0x0FFF;
/// Pattern in the first ID byte identifying padding packets
pub const DEFAULT_DISCARD_MASK: u8 = 0x0F;

/// Parsed ID and CRC words of a VoSPI packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw 16-bit ID word
    pub id: u16,
    /// Raw 16-bit CRC word (not validated unless requested)
    pub crc: u16,
}

impl PacketHeader {
    /// Parse the header from the start of a packet.
    ///
    /// Returns `None` if the slice is shorter than [`HEADER_SIZE`].
    #[inline]
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            id: u16::from_be_bytes([packet[0], packet[1]]),
            crc: u16::from_be_bytes([packet[2], packet[3]]),
        })
    }

    /// Whether the camera flagged this packet as a framing error
    #[inline]
    pub fn has_error_flag(&self) -> bool {
        self.id & ERROR_FLAG == ERROR_FLAG
    }

    /// Packet number within the current segment
    #[inline]
    pub fn packet_number(&self) -> u16 {
        self.id & PACKET_NUMBER_MASK
    }

    /// Segment number from the leading nibble of the ID word.
    ///
    /// Only meaningful on packet [`SEGMENT_NUMBER_PACKET`].
    #[inline]
    pub fn segment_number(&self) -> u8 {
        (self.id >> 12) as u8
    }

    /// Whether the first ID byte matches the padding pattern
    #[inline]
    pub fn is_padding(&self, discard_mask: u8) -> bool {
        is_padding(&self.id.to_be_bytes(), discard_mask)
    }
}

/// Check the padding pattern on raw packet bytes without parsing the header
#[inline]
pub fn is_padding(packet: &[u8], discard_mask: u8) -> bool {
    packet
        .first()
        .is_some_and(|&b| b & discard_mask == discard_mask)
}

/// A single packet inside a shared transfer chunk
///
/// Holding a `PacketRef` keeps its chunk alive; the ring buffer will not
/// overwrite a chunk while any view into it exists.
#[derive(Clone)]
pub struct PacketRef {
    chunk: Arc<[u8]>,
    offset: usize,
}

impl PacketRef {
    /// Create a view of the packet at `offset` in `chunk`.
    ///
    /// Returns `None` if the chunk does not hold a full packet at `offset`.
    pub fn new(chunk: Arc<[u8]>, offset: usize) -> Option<Self> {
        if offset.checked_add(PACKET_SIZE)? > chunk.len() {
            return None;
        }
        Some(Self { chunk, offset })
    }

    /// Copy raw bytes into a standalone packet view
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PACKET_SIZE {
            return None;
        }
        Self::new(Arc::from(bytes), 0)
    }

    /// Raw packet bytes, header included
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.chunk[self.offset..self.offset + PACKET_SIZE]
    }

    /// Parsed header words
    #[inline]
    pub fn header(&self) -> PacketHeader {
        let b = self.bytes();
        PacketHeader {
            id: u16::from_be_bytes([b[0], b[1]]),
            crc: u16::from_be_bytes([b[2], b[3]]),
        }
    }

    /// Pixel payload
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes()[HEADER_SIZE..]
    }

    /// Number of live views (including this one) into the same chunk
    pub fn chunk_refs(&self) -> usize {
        Arc::strong_count(&self.chunk)
    }
}

impl Deref for PacketRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl fmt::Debug for PacketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header();
        f.debug_struct("PacketRef")
            .field("id", &format_args!("{:#06x}", header.id))
            .field("crc", &format_args!("{:#06x}", header.crc))
            .field("offset", &self.offset)
            .finish()
    }
}
