//! `lepton-vospi` - Video Over SPI frame decoding for FLIR Lepton 3
//!
//! Turns the raw byte stream a Lepton 3 clocks out over SPI into complete
//! 160x120 16-bit thermal frames. The crate owns the data plane only: packet
//! validation, segment and frame reassembly, a zero-allocation transfer
//! ring, the producer/consumer streaming pipeline and resync recovery. The
//! bus itself is supplied by the caller through the [`Transport`] trait.
//!
//! ```rust,ignore
//! use lepton_vospi::{FrameImage, LeptonSession, SessionConfig};
//!
//! let mut session = LeptonSession::new(my_spi_bus, SessionConfig::from_env())?;
//! session.open()?;
//!
//! let mut image = FrameImage::new();
//! loop {
//!     session.retrieve_frame(&mut image)?;
//!     let (min, max) = image.min_max();
//!     log::info!("frame range {}..{}", min, max);
//! }
//! ```
//!
//! Offline work goes through [`capture`] (record every transfer of a live
//! session) and [`replay`] (feed a recording back through a session).

pub mod capture;
pub mod config;
pub mod frame;
pub mod frame_assembler;
pub mod packet;
pub mod packet_validation;
pub mod pipeline;
pub mod replay;
pub mod ring_buffer;
pub mod session;
pub mod test_utils;
pub mod transport;

pub use capture::{CaptureMetadata, CaptureState};
pub use config::{ConfigError, SessionConfig};
pub use frame::FrameImage;
pub use packet::PacketRef;
pub use replay::ReplayTransport;
pub use session::{LeptonSession, SessionError, SessionStats};
pub use transport::{BusSettings, Connection, SpiMode, Transport, TransportError};
