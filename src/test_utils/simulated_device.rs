//! Scripted camera for driving a session without hardware
//!
//! Each [`Transport::connect`] plays the next scripted session: the
//! connection clocks out that session's bytes packet by packet, then padding
//! forever, like a camera that has gone idle. Once the script runs out,
//! further connections only produce padding.
//!
//! Failures can be injected per session (transfer error after N transfers)
//! or for the device as a whole (connect refused after N connects).

use std::sync::Arc;
use std::time::Duration;

use crate::packet::PACKET_SIZE;
use crate::transport::{self, BusSettings, Connection, Transport, TransportError};

use super::packet_generator::padding_packet;

#[derive(Debug, Clone)]
struct ScriptedSession {
    bytes: Arc<[u8]>,
    fail_after: Option<usize>,
}

/// Scripted VoSPI camera implementing [`Transport`]
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    script: Vec<ScriptedSession>,
    next_session: usize,
    connects: usize,
    connect_limit: Option<usize>,
    idle_delay: Duration,
    last_settings: Option<BusSettings>,
}

impl SimulatedDevice {
    /// Device with an empty script: every connection yields only padding
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            next_session: 0,
            connects: 0,
            connect_limit: None,
            idle_delay: Duration::from_millis(1),
            last_settings: None,
        }
    }

    /// Append a session that streams `bytes`.
    ///
    /// A trailing partial packet is dropped.
    pub fn with_session(mut self, bytes: Vec<u8>) -> Self {
        self.script.push(ScriptedSession {
            bytes: trim_to_packets(bytes),
            fail_after: None,
        });
        self
    }

    /// Append a session whose transfer number `transfers` (0-based) fails
    pub fn with_failing_session(mut self, bytes: Vec<u8>, transfers: usize) -> Self {
        self.script.push(ScriptedSession {
            bytes: trim_to_packets(bytes),
            fail_after: Some(transfers),
        });
        self
    }

    /// Refuse every connect after the first `connects`
    pub fn fail_connect_after(mut self, connects: usize) -> Self {
        self.connect_limit = Some(connects);
        self
    }

    /// Pause applied to transfers that contain only padding
    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Successful connects so far
    pub fn connects(&self) -> usize {
        self.connects
    }

    /// Settings passed to the most recent connect
    pub fn last_settings(&self) -> Option<BusSettings> {
        self.last_settings
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_to_packets(mut bytes: Vec<u8>) -> Arc<[u8]> {
    let whole = bytes.len() / PACKET_SIZE * PACKET_SIZE;
    bytes.truncate(whole);
    Arc::from(bytes)
}

impl Transport for SimulatedDevice {
    type Connection = SimulatedConnection;

    fn connect(&mut self, settings: &BusSettings) -> transport::Result<SimulatedConnection> {
        if self.connect_limit.is_some_and(|limit| self.connects >= limit) {
            return Err(TransportError::Connect(format!(
                "simulated device refused connect #{}",
                self.connects + 1
            )));
        }

        self.connects += 1;
        self.last_settings = Some(*settings);

        let session = self.script.get(self.next_session).cloned();
        self.next_session += 1;
        let (bytes, fail_after) = match session {
            Some(session) => (session.bytes, session.fail_after),
            None => (Arc::from(Vec::new()), None),
        };

        log::debug!(
            "Simulated device connect #{}: {} scripted packets",
            self.connects,
            bytes.len() / PACKET_SIZE
        );

        Ok(SimulatedConnection {
            bytes,
            cursor: 0,
            transfers: 0,
            fail_after,
            idle_delay: self.idle_delay,
            padding: padding_packet(),
        })
    }
}

/// One connection to a [`SimulatedDevice`]
#[derive(Debug)]
pub struct SimulatedConnection {
    bytes: Arc<[u8]>,
    cursor: usize,
    transfers: usize,
    fail_after: Option<usize>,
    idle_delay: Duration,
    padding: Vec<u8>,
}

impl SimulatedConnection {
    /// Scripted bytes not yet clocked out
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }
}

impl Connection for SimulatedConnection {
    fn transfer(&mut self, rx: &mut [u8]) -> transport::Result<()> {
        if self.fail_after == Some(self.transfers) {
            return Err(TransportError::Transfer(format!(
                "simulated fault on transfer #{}",
                self.transfers
            )));
        }
        self.transfers += 1;

        let mut idle = true;
        for slot in rx.chunks_mut(PACKET_SIZE) {
            if self.cursor < self.bytes.len() {
                let end = self.cursor + slot.len();
                slot.copy_from_slice(&self.bytes[self.cursor..end]);
                self.cursor = end;
                idle = false;
            } else {
                slot.copy_from_slice(&self.padding[..slot.len()]);
            }
        }

        if idle && !self.idle_delay.is_zero() {
            std::thread::sleep(self.idle_delay);
        }
        Ok(())
    }

    fn close(self) -> transport::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{is_padding, DEFAULT_DISCARD_MASK};
    use crate::test_utils::{frame_stream, TestPattern};

    #[test]
    fn test_script_then_padding() {
        let stream = frame_stream(TestPattern::Coordinates);
        let mut device = SimulatedDevice::new().with_session(stream[..PACKET_SIZE * 3].to_vec());
        let mut connection = device.connect(&BusSettings::default()).unwrap();

        let mut rx = vec![0u8; PACKET_SIZE * 2];
        connection.transfer(&mut rx).unwrap();
        assert_eq!(rx, stream[..PACKET_SIZE * 2]);

        connection.transfer(&mut rx).unwrap();
        assert_eq!(rx[..PACKET_SIZE], stream[PACKET_SIZE * 2..PACKET_SIZE * 3]);
        assert!(is_padding(&rx[PACKET_SIZE..], DEFAULT_DISCARD_MASK));
        assert_eq!(connection.remaining(), 0);
    }

    #[test]
    fn test_each_connect_plays_next_session() {
        let mut device = SimulatedDevice::new()
            .with_session(frame_stream(TestPattern::Gradient))
            .with_session(frame_stream(TestPattern::Checkerboard));

        let first = device.connect(&BusSettings::default()).unwrap();
        let second = device.connect(&BusSettings::default()).unwrap();
        let third = device.connect(&BusSettings::default()).unwrap();

        assert_eq!(first.remaining(), 240 * PACKET_SIZE);
        assert_eq!(second.remaining(), 240 * PACKET_SIZE);
        assert_eq!(third.remaining(), 0);
        assert_eq!(device.connects(), 3);
    }

    #[test]
    fn test_injected_failures() {
        let mut device = SimulatedDevice::new()
            .with_failing_session(frame_stream(TestPattern::Gradient), 1)
            .fail_connect_after(1);

        let mut connection = device.connect(&BusSettings::default()).unwrap();
        let mut rx = vec![0u8; PACKET_SIZE];
        assert!(connection.transfer(&mut rx).is_ok());
        assert!(matches!(
            connection.transfer(&mut rx),
            Err(TransportError::Transfer(_))
        ));

        assert!(matches!(
            device.connect(&BusSettings::default()),
            Err(TransportError::Connect(_))
        ));
    }

    #[test]
    fn test_partial_trailing_packet_dropped() {
        let mut device = SimulatedDevice::new().with_session(vec![1u8; PACKET_SIZE + 7]);
        let connection = device.connect(&BusSettings::default()).unwrap();
        assert_eq!(connection.remaining(), PACKET_SIZE);
    }

    #[test]
    fn test_records_bus_settings() {
        let mut device = SimulatedDevice::new();
        let settings = BusSettings {
            speed_hz: 16_000_000,
            ..Default::default()
        };
        device.connect(&settings).unwrap();
        assert_eq!(device.last_settings(), Some(settings));
    }
}
