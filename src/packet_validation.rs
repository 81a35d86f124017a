//! Packet classification for the VoSPI stream
//!
//! Classifies one raw packet as a blank discard, a framing fault or a valid
//! packet carrying its sequence number. Classification is pure: the caller
//! decides whether a fault warrants a resync.
//!
//! Padding packets (see [`crate::packet::is_padding`]) are dropped by the
//! streaming pipeline and never reach this module.
//!
//! The CRC word is not checked by default. [`PacketValidator::with_crc`]
//! enables CRC-16/CCITT verification, which turns corrupted packets into
//! faults and therefore makes resyncs more frequent on noisy buses.

use thiserror::Error;

use crate::packet::{PacketHeader, MAX_PACKET_NUMBER, PACKET_SIZE};

/// CRC-16/CCITT polynomial used by VoSPI
const CRC16_POLY: u16 = 0x1021;

/// Framing faults detected on a single packet
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFault {
    /// Packet is shorter than a full VoSPI packet.
    #[error("packet truncated to {len} bytes")]
    Truncated {
        /// Actual length of the slice.
        len: usize,
    },

    /// Camera set the error flag in the ID word.
    #[error("error flag set in packet header {id:#06x}")]
    ErrorFlag {
        /// Raw ID word.
        id: u16,
    },

    /// Packet number is beyond the last packet of a segment.
    #[error("invalid packet number {0}")]
    InvalidPacketNumber(u16),

    /// CRC word does not match the packet contents.
    #[error("CRC mismatch: header {expected:#06x}, computed {actual:#06x}")]
    CrcMismatch {
        /// CRC carried in the packet.
        expected: u16,
        /// CRC computed over the packet.
        actual: u16,
    },
}

/// Outcome of classifying one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Blank packet the camera sends while not ready; skip it.
    Discard,
    /// Valid packet with its packet number.
    Sequence(u16),
    /// Framing fault; the stream must be resynchronised.
    Fatal(PacketFault),
}

/// Packet classifier with optional CRC verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketValidator {
    verify_crc: bool,
}

impl PacketValidator {
    /// Validator that ignores the CRC word
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator that also checks the CRC word
    pub fn with_crc() -> Self {
        Self { verify_crc: true }
    }

    /// Whether CRC verification is enabled
    pub fn verifies_crc(&self) -> bool {
        self.verify_crc
    }

    /// Classify a single packet.
    pub fn classify(&self, packet: &[u8]) -> PacketClass {
        if packet.len() < PACKET_SIZE {
            return PacketClass::Fatal(PacketFault::Truncated { len: packet.len() });
        }
        let Some(header) = PacketHeader::parse(packet) else {
            return PacketClass::Fatal(PacketFault::Truncated { len: packet.len() });
        };

        if header.has_error_flag() {
            return PacketClass::Fatal(PacketFault::ErrorFlag { id: header.id });
        }

        let packet_num = header.packet_number();
        if packet_num > MAX_PACKET_NUMBER {
            return PacketClass::Fatal(PacketFault::InvalidPacketNumber(packet_num));
        }

        // Blank packet 0 with a zeroed CRC word: camera is not streaming yet
        if packet_num == 0 && header.crc == 0 {
            return PacketClass::Discard;
        }

        if self.verify_crc {
            let actual = packet_crc16(packet).unwrap_or(0);
            if actual != header.crc {
                return PacketClass::Fatal(PacketFault::CrcMismatch {
                    expected: header.crc,
                    actual,
                });
            }
        }

        PacketClass::Sequence(packet_num)
    }
}

/// Classify a packet without CRC verification
#[inline]
pub fn validate_packet(packet: &[u8]) -> PacketClass {
    PacketValidator::new().classify(packet)
}

/// Compute the VoSPI CRC-16 of a packet.
///
/// The top nibble of the first ID byte and both CRC bytes are treated as
/// zero. Returns `None` if the packet is too short to hold a header.
pub fn packet_crc16(packet: &[u8]) -> Option<u16> {
    if packet.len() < 4 {
        return None;
    }

    let mut crc = 0u16;
    for (idx, &byte) in packet.iter().enumerate() {
        let normalized = match idx {
            0 => byte & 0x0F,
            2 | 3 => 0,
            _ => byte,
        };

        crc ^= u16::from(normalized) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    Some(crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_header(id: u16, crc: u16) -> Vec<u8> {
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[..2].copy_from_slice(&id.to_be_bytes());
        packet[2..4].copy_from_slice(&crc.to_be_bytes());
        packet
    }

    #[test]
    fn test_valid_packet_numbers() {
        for n in 1..=MAX_PACKET_NUMBER {
            let packet = packet_with_header(n, 0);
            assert_eq!(validate_packet(&packet), PacketClass::Sequence(n));
        }
    }

    #[test]
    fn test_packet_zero_with_crc_is_valid() {
        let packet = packet_with_header(0x0000, 0x1234);
        assert_eq!(validate_packet(&packet), PacketClass::Sequence(0));
    }

    #[test]
    fn test_blank_packet_zero_discarded() {
        let packet = packet_with_header(0x0000, 0x0000);
        assert_eq!(validate_packet(&packet), PacketClass::Discard);
    }

    #[test]
    fn test_error_flag_is_fatal_for_any_packet_number() {
        for id in [0x8000u16, 0x8001, 0x8014, 0x803B, 0x8FFF, 0xB014] {
            let packet = packet_with_header(id, 0xABCD);
            assert_eq!(
                validate_packet(&packet),
                PacketClass::Fatal(PacketFault::ErrorFlag { id })
            );
        }
    }

    #[test]
    fn test_invalid_packet_number_is_fatal() {
        let packet = packet_with_header(60, 0);
        assert_eq!(
            validate_packet(&packet),
            PacketClass::Fatal(PacketFault::InvalidPacketNumber(60))
        );

        let packet = packet_with_header(0x0ABC, 0);
        assert_eq!(
            validate_packet(&packet),
            PacketClass::Fatal(PacketFault::InvalidPacketNumber(0x0ABC))
        );
    }

    #[test]
    fn test_truncated_packet_is_fatal() {
        assert_eq!(
            validate_packet(&[0x00, 0x01, 0x00]),
            PacketClass::Fatal(PacketFault::Truncated { len: 3 })
        );
        assert_eq!(
            validate_packet(&[0u8; PACKET_SIZE - 1]),
            PacketClass::Fatal(PacketFault::Truncated {
                len: PACKET_SIZE - 1
            })
        );
    }

    #[test]
    fn test_crc_ignored_by_default() {
        let packet = packet_with_header(0x0005, 0xDEAD);
        assert_eq!(validate_packet(&packet), PacketClass::Sequence(5));
    }

    #[test]
    fn test_crc_verification() {
        let mut packet = packet_with_header(0x3014, 0);
        packet[4] = 0x5A;
        packet[100] = 0xC3;
        let crc = packet_crc16(&packet).unwrap();
        packet[2..4].copy_from_slice(&crc.to_be_bytes());

        let validator = PacketValidator::with_crc();
        assert!(validator.verifies_crc());
        assert_eq!(validator.classify(&packet), PacketClass::Sequence(20));

        // Flip a payload bit
        packet[50] ^= 0x01;
        assert!(matches!(
            validator.classify(&packet),
            PacketClass::Fatal(PacketFault::CrcMismatch { expected, .. }) if expected == crc
        ));
    }

    #[test]
    fn test_crc_short_packet_returns_none() {
        assert_eq!(packet_crc16(&[1, 2, 3]), None);
    }

    #[test]
    fn test_crc_masks_id_upper_nibble_and_crc_field() {
        let mut packet_a = [0u8; 12];
        packet_a[0] = 0x10;
        packet_a[1] = 0x14;
        packet_a[4] = 0x5A;

        let mut packet_b = packet_a;
        packet_b[0] = 0xA0;
        packet_b[2] = 0x12;
        packet_b[3] = 0x34;

        assert_eq!(packet_crc16(&packet_a), packet_crc16(&packet_b));
    }

    #[test]
    fn test_crc_known_vector() {
        let packet = [0x10, 0x14, 0x00, 0x00, 0xAB, 0xCD, 0x10, 0x20, 0x30, 0x40];
        assert_eq!(packet_crc16(&packet), Some(0x2F69));
    }

    #[test]
    fn test_fault_messages() {
        let fault = PacketFault::ErrorFlag { id: 0x8014 };
        assert_eq!(fault.to_string(), "error flag set in packet header 0x8014");
        assert_eq!(
            PacketFault::InvalidPacketNumber(61).to_string(),
            "invalid packet number 61"
        );
    }
}
