//! Session configuration
//!
//! Defaults reproduce the reference Lepton 3 setup: 30 MHz SPI mode 3,
//! 200-packet transfers into an 8-chunk ring, a 1024-packet queue, a 10 s
//! frame deadline and a 300 ms resync backoff.
//!
//! Every field can be overridden from the environment:
//!
//! | Variable                        | Field                   |
//! |---------------------------------|-------------------------|
//! | `LEPTON_SPI_SPEED_HZ`           | `bus.speed_hz`          |
//! | `LEPTON_PACKETS_PER_TRANSFER`   | `packets_per_transfer`  |
//! | `LEPTON_MAX_PACKETS_PER_FRAME`  | `max_packets_per_frame` |
//! | `LEPTON_QUEUE_CAPACITY`         | `queue_capacity`        |
//! | `LEPTON_FRAME_TIMEOUT_MS`       | `frame_timeout_ms`      |
//! | `LEPTON_RESYNC_BACKOFF_MS`      | `resync_backoff_ms`     |
//! | `LEPTON_DISCARD_MASK`           | `discard_mask`          |
//! | `LEPTON_VERIFY_CRC`             | `verify_crc`            |
//!
//! Unparseable values are logged and ignored.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::DEFAULT_DISCARD_MASK;
use crate::ring_buffer::RingBuffer;
use crate::transport::BusSettings;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field that must be non-zero is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Bus clock is outside what the camera supports.
    #[error("SPI clock {0} Hz is outside the supported range")]
    SpeedOutOfRange(u32),

    /// A transfer smaller than the frame window cannot be tracked by the ring.
    #[error("max_packets_per_frame ({max}) is smaller than packets_per_transfer ({per_transfer})")]
    WindowTooSmall {
        /// Configured frame window.
        max: usize,
        /// Configured transfer size.
        per_transfer: usize,
    },

    /// I/O error reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fastest VoSPI clock the Lepton accepts
pub const MAX_SPEED_HZ: u32 = 30_000_000;
/// Slowest clock that still sustains the frame rate
pub const MIN_SPEED_HZ: u32 = 2_200_000;

/// Tunables for a [`LeptonSession`](crate::session::LeptonSession)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bus settings passed to the transport on every connect
    pub bus: BusSettings,
    /// Packets read per bus transfer (one ring chunk)
    pub packets_per_transfer: usize,
    /// Upper bound of packets read while waiting for one frame; sizes the ring
    pub max_packets_per_frame: usize,
    /// Capacity of the producer to consumer packet queue
    pub queue_capacity: usize,
    /// Deadline for one `retrieve_frame` call, in milliseconds
    pub frame_timeout_ms: u64,
    /// Pause between closing and reopening the bus on resync, in milliseconds
    pub resync_backoff_ms: u64,
    /// Header bits that mark a padding packet
    pub discard_mask: u8,
    /// Check the CRC word of every packet
    pub verify_crc: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            packets_per_transfer: 200,
            max_packets_per_frame: 1500,
            queue_capacity: 1024,
            frame_timeout_ms: 10_000,
            resync_backoff_ms: 300,
            discard_mask: DEFAULT_DISCARD_MASK,
            verify_crc: false,
        }
    }
}

impl SessionConfig {
    /// Defaults with `LEPTON_*` environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Json`] if it is malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "LEPTON_SPI_SPEED_HZ", &mut self.bus.speed_hz, parse_number);
        override_with(
            &lookup,
            "LEPTON_PACKETS_PER_TRANSFER",
            &mut self.packets_per_transfer,
            parse_number,
        );
        override_with(
            &lookup,
            "LEPTON_MAX_PACKETS_PER_FRAME",
            &mut self.max_packets_per_frame,
            parse_number,
        );
        override_with(&lookup, "LEPTON_QUEUE_CAPACITY", &mut self.queue_capacity, parse_number);
        override_with(&lookup, "LEPTON_FRAME_TIMEOUT_MS", &mut self.frame_timeout_ms, parse_number);
        override_with(&lookup, "LEPTON_RESYNC_BACKOFF_MS", &mut self.resync_backoff_ms, parse_number);
        override_with(&lookup, "LEPTON_DISCARD_MASK", &mut self.discard_mask, parse_mask);
        override_with(&lookup, "LEPTON_VERIFY_CRC", &mut self.verify_crc, parse_flag);
    }

    /// Per-frame deadline
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Resync backoff
    pub fn resync_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_backoff_ms)
    }

    /// Number of ring chunks implied by the transfer and window sizes
    pub fn ring_chunks(&self) -> usize {
        RingBuffer::chunks_for(self.packets_per_transfer, self.max_packets_per_frame)
    }

    /// Reject impossible values.
    ///
    /// A ring smaller than the queue can hold plus the two chunks being
    /// filled and drained is accepted with a warning: the ring then
    /// allocates replacement chunks under backpressure.
    ///
    /// # Errors
    ///
    /// Returns the first offending field as a [`ConfigError`].
    pub fn validate(&self) -> Result<()> {
        if self.bus.speed_hz == 0 {
            return Err(ConfigError::Zero("bus.speed_hz"));
        }
        if !(MIN_SPEED_HZ..=MAX_SPEED_HZ).contains(&self.bus.speed_hz) {
            return Err(ConfigError::SpeedOutOfRange(self.bus.speed_hz));
        }
        if self.bus.bits_per_word == 0 {
            return Err(ConfigError::Zero("bus.bits_per_word"));
        }
        if self.packets_per_transfer == 0 {
            return Err(ConfigError::Zero("packets_per_transfer"));
        }
        if self.max_packets_per_frame == 0 {
            return Err(ConfigError::Zero("max_packets_per_frame"));
        }
        if self.max_packets_per_frame < self.packets_per_transfer {
            return Err(ConfigError::WindowTooSmall {
                max: self.max_packets_per_frame,
                per_transfer: self.packets_per_transfer,
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::Zero("frame_timeout_ms"));
        }
        // A zero mask matches every packet
        if self.discard_mask == 0 {
            return Err(ConfigError::Zero("discard_mask"));
        }

        let needed = self.queue_capacity.div_ceil(self.packets_per_transfer) + 2;
        if self.ring_chunks() < needed {
            log::warn!(
                "Ring of {} chunks is smaller than the {} needed for a {}-packet queue; expect recycle misses",
                self.ring_chunks(),
                needed,
                self.queue_capacity
            );
        }

        Ok(())
    }
}

fn override_with<T, F, P>(lookup: &F, key: &str, field: &mut T, parse: P)
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse(raw.trim()) {
        Some(value) => {
            log::debug!("{} override: {}", key, raw.trim());
            *field = value;
        }
        None => log::warn!("Ignoring unparseable {}='{}'", key, raw),
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Option<T> {
    s.parse().ok()
}

/// Accepts decimal or `0x`-prefixed hex
fn parse_mask(s: &str) -> Option<u8> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_reference_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.bus.speed_hz, 30_000_000);
        assert_eq!(config.packets_per_transfer, 200);
        assert_eq!(config.max_packets_per_frame, 1500);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.frame_timeout(), Duration::from_secs(10));
        assert_eq!(config.resync_backoff(), Duration::from_millis(300));
        assert_eq!(config.discard_mask, 0x0F);
        assert!(!config.verify_crc);
        assert_eq!(config.ring_chunks(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SessionConfig::default();
        config.apply_overrides(lookup_from(&[
            ("LEPTON_SPI_SPEED_HZ", "20000000"),
            ("LEPTON_QUEUE_CAPACITY", " 512 "),
            ("LEPTON_DISCARD_MASK", "0x0e"),
            ("LEPTON_VERIFY_CRC", "TRUE"),
        ]));

        assert_eq!(config.bus.speed_hz, 20_000_000);
        assert_eq!(config.queue_capacity, 512);
        assert_eq!(config.discard_mask, 0x0E);
        assert!(config.verify_crc);
        // Untouched fields keep defaults
        assert_eq!(config.packets_per_transfer, 200);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = SessionConfig::default();
        config.apply_overrides(lookup_from(&[
            ("LEPTON_QUEUE_CAPACITY", "lots"),
            ("LEPTON_DISCARD_MASK", "0x1FF"),
            ("LEPTON_VERIFY_CRC", "maybe"),
        ]));
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_json_partial_document() {
        let config = SessionConfig::from_json(r#"{"queue_capacity": 64, "verify_crc": true}"#).unwrap();
        assert_eq!(config.queue_capacity, 64);
        assert!(config.verify_crc);
        assert_eq!(config.bus, BusSettings::default());
        assert_eq!(config.frame_timeout_ms, 10_000);
    }

    #[test]
    fn test_json_malformed() {
        assert!(matches!(
            SessionConfig::from_json("{not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lepton.json");
        let config = SessionConfig {
            resync_backoff_ms: 50,
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(SessionConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_zero_fields() {
        let cases: [fn(&mut SessionConfig); 5] = [
            |c| c.packets_per_transfer = 0,
            |c| c.queue_capacity = 0,
            |c| c.frame_timeout_ms = 0,
            |c| c.discard_mask = 0,
            |c| c.bus.bits_per_word = 0,
        ];
        for mutate in cases {
            let mut config = SessionConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
        }
    }

    #[test]
    fn test_validate_speed_range() {
        let mut config = SessionConfig::default();
        config.bus.speed_hz = 40_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SpeedOutOfRange(40_000_000))
        ));
        config.bus.speed_hz = 10_000_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_window() {
        let config = SessionConfig {
            packets_per_transfer: 200,
            max_packets_per_frame: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WindowTooSmall { max: 100, per_transfer: 200 })
        ));
    }

    #[test]
    fn test_undersized_ring_is_only_a_warning() {
        let config = SessionConfig {
            packets_per_transfer: 10,
            max_packets_per_frame: 20,
            queue_capacity: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
