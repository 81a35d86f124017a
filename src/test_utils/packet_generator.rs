//! Synthetic VoSPI packet generation for testing
//!
//! Generates valid Lepton 3 packets with known pixel values for
//! pixel-perfect test validation, plus the padding, blank and error packets
//! a real camera interleaves with them.
//!
//! # Example
//!
//! ```rust,ignore
//! use lepton_vospi::test_utils::{frame_stream, TestPattern};
//!
//! // 240 packets (4 segments of 60) for one frame, as raw bytes
//! let bytes = frame_stream(TestPattern::Gradient);
//!
//! // Expected image for comparison
//! let expected = TestPattern::Gradient.image();
//! ```

use crate::frame::FrameImage;
use crate::packet::{
    FRAME_WIDTH, HEADER_SIZE, PACKETS_PER_SEGMENT, PACKET_SIZE, PAYLOAD_SIZE, PIXELS_PER_PACKET,
    SEGMENTS_PER_FRAME, SEGMENT_NUMBER_PACKET,
};
use crate::packet_validation::packet_crc16;

/// Known pixel patterns for synthetic frames
///
/// Every pattern is non-zero in the first packet of a frame, so its CRC is
/// non-zero and packet 0 is never mistaken for a blank packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// `(y << 8) | x`: every pixel unique
    Coordinates,
    /// Smooth ramp in a plausible 14-bit radiometric range
    Gradient,
    /// 8x8 blocks alternating between two levels
    Checkerboard,
}

impl TestPattern {
    /// Pixel value at column `x`, row `y`
    pub fn pixel(self, x: usize, y: usize) -> u16 {
        match self {
            Self::Coordinates => ((y << 8) | x) as u16,
            Self::Gradient => (7000 + x * 10 + y * 20) as u16,
            Self::Checkerboard => {
                if (x / 8 + y / 8) % 2 == 0 {
                    0x1F40
                } else {
                    0x2328
                }
            }
        }
    }

    /// The full expected image
    pub fn image(self) -> FrameImage {
        let mut image = FrameImage::new();
        for (i, pixel) in image.pixels_mut().iter_mut().enumerate() {
            *pixel = self.pixel(i % FRAME_WIDTH, i / FRAME_WIDTH);
        }
        image
    }

    /// Payload of frame slot `slot` (0-239)
    pub fn payload(self, slot: usize) -> [u8; PAYLOAD_SIZE] {
        let y = slot / 2;
        let x0 = (slot % 2) * PIXELS_PER_PACKET;
        let mut payload = [0u8; PAYLOAD_SIZE];
        for (i, bytes) in payload.chunks_exact_mut(2).enumerate() {
            bytes.copy_from_slice(&self.pixel(x0 + i, y).to_be_bytes());
        }
        payload
    }
}

/// Build one VoSPI packet.
///
/// `segment` is written into the leading nibble of the ID word only on
/// packet 20, as the camera does. The CRC word is filled with the real
/// CRC-16 of the packet.
pub fn build_packet(packet_num: u16, segment: u8, payload: &[u8; PAYLOAD_SIZE]) -> Vec<u8> {
    let mut id = packet_num & 0x0FFF;
    if packet_num == SEGMENT_NUMBER_PACKET {
        id |= u16::from(segment & 0x0F) << 12;
    }

    let mut packet = vec![0u8; PACKET_SIZE];
    packet[..2].copy_from_slice(&id.to_be_bytes());
    packet[HEADER_SIZE..].copy_from_slice(payload);

    let crc = packet_crc16(&packet).unwrap_or(0);
    packet[2..4].copy_from_slice(&crc.to_be_bytes());
    packet
}

/// Padding packet the camera sends between segments
pub fn padding_packet() -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    packet[0] = 0x0F;
    packet[1] = 0xFF;
    packet
}

/// Blank packet 0 the camera sends before streaming starts
pub fn blank_packet() -> Vec<u8> {
    vec![0u8; PACKET_SIZE]
}

/// Packet with the error flag set
pub fn fatal_packet(packet_num: u16) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    let id = 0x8000 | (packet_num & 0x0FFF);
    packet[..2].copy_from_slice(&id.to_be_bytes());
    packet[2] = 0xDE;
    packet[3] = 0xAD;
    packet
}

/// The 60 packets of `segment` (1-4)
pub fn segment_packets(pattern: TestPattern, segment: u8) -> Vec<Vec<u8>> {
    let first_slot = usize::from(segment.saturating_sub(1)) * PACKETS_PER_SEGMENT;
    (0..PACKETS_PER_SEGMENT)
        .map(|n| build_packet(n as u16, segment, &pattern.payload(first_slot + n)))
        .collect()
}

/// The 240 packets of one frame, segments 1 to 4 in order
pub fn frame_packets(pattern: TestPattern) -> Vec<Vec<u8>> {
    (1..=SEGMENTS_PER_FRAME as u8)
        .flat_map(|segment| segment_packets(pattern, segment))
        .collect()
}

/// One frame as a contiguous byte stream
pub fn frame_stream(pattern: TestPattern) -> Vec<u8> {
    frame_packets(pattern).concat()
}

/// Builder for scripted VoSPI byte streams
///
/// ```rust,ignore
/// let bytes = StreamBuilder::new()
///     .padding(10)
///     .segments(TestPattern::Gradient, 1..=2)
///     .fatal(5)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct StreamBuilder {
    bytes: Vec<u8>,
}

impl StreamBuilder {
    /// Empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `count` padding packets
    pub fn padding(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.bytes.extend(padding_packet());
        }
        self
    }

    /// Append `count` blank packets
    pub fn blank(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.bytes.extend(blank_packet());
        }
        self
    }

    /// Append a packet with the error flag set
    pub fn fatal(mut self, packet_num: u16) -> Self {
        self.bytes.extend(fatal_packet(packet_num));
        self
    }

    /// Append whole segments of `pattern`
    pub fn segments(mut self, pattern: TestPattern, segments: std::ops::RangeInclusive<u8>) -> Self {
        for segment in segments {
            for packet in segment_packets(pattern, segment) {
                self.bytes.extend(packet);
            }
        }
        self
    }

    /// Append the first `count` packets of `segment`
    pub fn partial_segment(mut self, pattern: TestPattern, segment: u8, count: usize) -> Self {
        for packet in segment_packets(pattern, segment).into_iter().take(count) {
            self.bytes.extend(packet);
        }
        self
    }

    /// Append a full frame
    pub fn frame(self, pattern: TestPattern) -> Self {
        self.segments(pattern, 1..=SEGMENTS_PER_FRAME as u8)
    }

    /// Append arbitrary packet bytes
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Number of whole packets so far
    pub fn packet_count(&self) -> usize {
        self.bytes.len() / PACKET_SIZE
    }

    /// Finish the stream
    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{is_padding, PacketHeader, DEFAULT_DISCARD_MASK};
    use crate::packet_validation::{validate_packet, PacketClass, PacketValidator};

    #[test]
    fn test_build_packet_header() {
        let packet = build_packet(20, 3, &[0u8; PAYLOAD_SIZE]);
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.packet_number(), 20);
        assert_eq!(header.segment_number(), 3);
        assert!(!header.has_error_flag());

        // Segment only encoded on packet 20
        let packet = build_packet(21, 3, &[0u8; PAYLOAD_SIZE]);
        assert_eq!(packet[0], 0);
    }

    #[test]
    fn test_generated_crc_verifies() {
        let validator = PacketValidator::with_crc();
        for packet in frame_packets(TestPattern::Checkerboard) {
            assert!(matches!(validator.classify(&packet), PacketClass::Sequence(_)));
        }
    }

    #[test]
    fn test_patterns_never_blank_first_packet() {
        for pattern in [
            TestPattern::Coordinates,
            TestPattern::Gradient,
            TestPattern::Checkerboard,
        ] {
            let first = &frame_packets(pattern)[0];
            assert_eq!(validate_packet(first), PacketClass::Sequence(0));
        }
    }

    #[test]
    fn test_special_packets() {
        assert!(is_padding(&padding_packet(), DEFAULT_DISCARD_MASK));
        assert_eq!(validate_packet(&blank_packet()), PacketClass::Discard);
        assert!(matches!(validate_packet(&fatal_packet(7)), PacketClass::Fatal(_)));
    }

    #[test]
    fn test_frame_layout() {
        let packets = frame_packets(TestPattern::Coordinates);
        assert_eq!(packets.len(), 240);
        assert_eq!(frame_stream(TestPattern::Coordinates).len(), 240 * PACKET_SIZE);

        // Packet 20 of segment 2 carries segment number 2
        assert_eq!(PacketHeader::parse(&packets[80]).unwrap().segment_number(), 2);
        // Slot 61 is the right half of row 30
        let payload = &packets[61][HEADER_SIZE..];
        assert_eq!(
            u16::from_be_bytes([payload[0], payload[1]]),
            TestPattern::Coordinates.pixel(80, 30)
        );
    }

    #[test]
    fn test_stream_builder() {
        let builder = StreamBuilder::new()
            .padding(2)
            .partial_segment(TestPattern::Gradient, 1, 10)
            .fatal(10);
        assert_eq!(builder.packet_count(), 13);
        assert_eq!(builder.build().len(), 13 * PACKET_SIZE);
    }

    #[test]
    fn test_pattern_image_matches_pixels() {
        let image = TestPattern::Gradient.image();
        assert_eq!(image.get(3, 4), Some(TestPattern::Gradient.pixel(3, 4)));
        assert_eq!(image.get(159, 119), Some(7000 + 1590 + 2380));
    }
}
