//! Bus transport abstraction
//!
//! The physical bus driver lives outside this crate. Anything that can open
//! a full-duplex connection and clock a receive buffer full of camera output
//! can drive a [`LeptonSession`](crate::session::LeptonSession): a Linux
//! spidev handle, a USB-SPI bridge, the [`ReplayTransport`](crate::replay::ReplayTransport)
//! or the simulated device in [`test_utils`](crate::test_utils).
//!
//! The session only ever issues receive-only exchanges: nothing is written
//! to the camera, and `rx` always holds a whole number of packets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference clock rate for the Lepton 3 VoSPI bus
pub const DEFAULT_SPEED_HZ: u32 = 30_000_000;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Opening the bus or configuring it failed.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// A full-duplex exchange failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Closing the connection failed.
    #[error("failed to close: {0}")]
    Close(String),

    /// I/O error from the underlying device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// SPI clock polarity and phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpiMode {
    /// CPOL=0, CPHA=0
    Mode0,
    /// CPOL=0, CPHA=1
    Mode1,
    /// CPOL=1, CPHA=0
    Mode2,
    /// CPOL=1, CPHA=1 (required by the Lepton)
    #[default]
    Mode3,
}

/// Bus configuration passed to [`Transport::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Clock rate in Hz
    pub speed_hz: u32,
    /// Clock polarity and phase
    pub mode: SpiMode,
    /// Bits per word
    pub bits_per_word: u8,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            speed_hz: DEFAULT_SPEED_HZ,
            mode: SpiMode::Mode3,
            bits_per_word: 8,
        }
    }
}

/// Factory for bus connections
///
/// A session connects once on open and again after every resync.
pub trait Transport: Send {
    /// Connection type handed to the streaming thread
    type Connection: Connection + Send + 'static;

    /// Open and configure the bus.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the bus cannot be opened or
    /// configured.
    fn connect(&mut self, settings: &BusSettings) -> Result<Self::Connection>;
}

/// An open bus connection
pub trait Connection {
    /// Clock `rx.len()` bytes out of the device into `rx`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Transfer`] if the exchange fails. The
    /// streaming loop treats any transfer error as fatal.
    fn transfer(&mut self, rx: &mut [u8]) -> Result<()>;

    /// Release the bus.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Close`] if the device reports a failure.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bus_settings() {
        let settings = BusSettings::default();
        assert_eq!(settings.speed_hz, 30_000_000);
        assert_eq!(settings.mode, SpiMode::Mode3);
        assert_eq!(settings.bits_per_word, 8);
    }

    #[test]
    fn test_bus_settings_json() {
        let json = r#"{"speed_hz":20000000,"mode":"Mode0","bits_per_word":8}"#;
        let settings: BusSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.speed_hz, 20_000_000);
        assert_eq!(settings.mode, SpiMode::Mode0);
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::Transfer("bus reset".to_string());
        assert_eq!(err.to_string(), "transfer failed: bus reset");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let err: TransportError = io.into();
        assert!(err.to_string().contains("no such device"));
    }
}
