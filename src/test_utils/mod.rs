//! Test utilities for `lepton-vospi`
//!
//! Provides synthetic VoSPI stream generation and a scripted simulated
//! camera for exercising the decoding pipeline without hardware.

pub mod packet_generator;
pub mod simulated_device;

pub use packet_generator::*;
pub use simulated_device::*;
