//! Streaming producer
//!
//! One thread per open connection. Each iteration takes the next ring chunk,
//! performs a single bus transfer of exactly the chunk size, splits the chunk
//! into packet views, drops padding and forwards the rest through a bounded
//! FIFO queue to the session.
//!
//! The producer owns the connection and the ring while it runs and hands
//! both back through its join handle, so the connection can only be closed
//! once the thread has finished.
//!
//! Cancellation is cooperative: the flag is checked at the top of every
//! iteration and before every enqueue. A transfer already in progress always
//! completes. [`Pipeline::stop`] also drops the queue receiver, which wakes a
//! producer blocked on a full queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture::CaptureState;
use crate::packet::{self, PacketRef};
use crate::ring_buffer::RingBuffer;
use crate::transport::{Connection, TransportError};

/// Lock-free counters shared with the producer thread
#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// Bus transfers completed
    pub transfers: AtomicU64,
    /// Packets read off the bus, padding included
    pub packets: AtomicU64,
    /// Padding packets dropped before the queue
    pub padding: AtomicU64,
    /// Ring chunks replaced because they were still referenced
    pub recycle_misses: AtomicU64,
}

/// What the producer thread hands back when it exits
pub struct ProducerExit<C> {
    /// The connection, still open
    pub connection: C,
    /// The ring, for reuse by the next pipeline
    pub ring: RingBuffer,
    /// The transfer error that ended the loop, if any
    pub error: Option<TransportError>,
}

/// A running producer thread and the consumer end of its queue
pub struct Pipeline<C: Connection + Send + 'static> {
    receiver: Option<Receiver<PacketRef>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<ProducerExit<C>>>,
}

impl<C: Connection + Send + 'static> Pipeline<C> {
    /// Spawn the producer.
    ///
    /// `counters` accumulate across pipelines; the session passes the same
    /// instance to every restart.
    pub fn start(
        connection: C,
        ring: RingBuffer,
        queue_capacity: usize,
        discard_mask: u8,
        capture: Option<Arc<CaptureState>>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let (sender, receiver) = mpsc::sync_channel(queue_capacity.max(1));
        let cancel = Arc::new(AtomicBool::new(false));

        let producer = Producer {
            connection,
            ring,
            sender,
            cancel: Arc::clone(&cancel),
            discard_mask,
            capture,
            counters,
        };
        let handle = thread::spawn(move || producer.run());

        log::debug!("Streaming pipeline started (queue capacity {})", queue_capacity);

        Self {
            receiver: Some(receiver),
            cancel,
            handle: Some(handle),
        }
    }

    /// Wait up to `timeout` for the next packet.
    ///
    /// # Errors
    ///
    /// [`RecvTimeoutError::Timeout`] if nothing arrived in time;
    /// [`RecvTimeoutError::Disconnected`] once the producer has exited and
    /// the queue is drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<PacketRef, RecvTimeoutError> {
        match &self.receiver {
            Some(receiver) => receiver.recv_timeout(timeout),
            None => Err(RecvTimeoutError::Disconnected),
        }
    }

    /// Whether the producer thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the producer and wait for it to exit.
    ///
    /// Returns `None` only if the producer thread panicked, in which case the
    /// connection was dropped with it.
    pub fn stop(mut self) -> Option<ProducerExit<C>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<ProducerExit<C>> {
        self.cancel.store(true, Ordering::Release);
        // Unblocks a producer waiting on a full queue
        drop(self.receiver.take());

        let handle = self.handle.take()?;
        match handle.join() {
            Ok(exit) => {
                log::debug!("Streaming pipeline stopped");
                Some(exit)
            }
            Err(_) => {
                log::error!("Streaming thread panicked");
                None
            }
        }
    }
}

impl<C: Connection + Send + 'static> Drop for Pipeline<C> {
    fn drop(&mut self) {
        if let Some(exit) = self.shutdown() {
            if let Err(e) = exit.connection.close() {
                log::warn!("Failed to close connection on pipeline drop: {}", e);
            }
        }
    }
}

struct Producer<C> {
    connection: C,
    ring: RingBuffer,
    sender: SyncSender<PacketRef>,
    cancel: Arc<AtomicBool>,
    discard_mask: u8,
    capture: Option<Arc<CaptureState>>,
    counters: Arc<PipelineCounters>,
}

impl<C: Connection> Producer<C> {
    fn run(mut self) -> ProducerExit<C> {
        let error = self.stream();
        ProducerExit {
            connection: self.connection,
            ring: self.ring,
            error,
        }
    }

    fn stream(&mut self) -> Option<TransportError> {
        let mut misses = self.ring.recycle_misses();

        while !self.cancel.load(Ordering::Acquire) {
            let mut chunk = self.ring.next_chunk();
            if let Err(e) = self.connection.transfer(chunk.bytes_mut()) {
                log::warn!("Transfer failed, stopping stream: {}", e);
                return Some(e);
            }
            self.counters.transfers.fetch_add(1, Ordering::Relaxed);

            if let Some(capture) = &self.capture {
                capture.record_transfer(chunk.bytes());
            }

            for view in chunk.packets() {
                self.counters.packets.fetch_add(1, Ordering::Relaxed);
                if packet::is_padding(&view, self.discard_mask) {
                    self.counters.padding.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if self.cancel.load(Ordering::Acquire) {
                    return None;
                }
                if self.sender.send(view).is_err() {
                    // Receiver gone: the session is shutting down
                    return None;
                }
            }

            let now = self.ring.recycle_misses();
            if now > misses {
                self.counters
                    .recycle_misses
                    .fetch_add(now - misses, Ordering::Relaxed);
                misses = now;
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PACKET_SIZE;
    use crate::test_utils::{build_packet, padding_packet};
    use crate::transport;

    /// Connection that replays a fixed byte stream, then padding forever
    struct StreamConnection {
        bytes: Vec<u8>,
        cursor: usize,
        fail_after: Option<usize>,
        transfers: usize,
    }

    impl StreamConnection {
        fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes,
                cursor: 0,
                fail_after: None,
                transfers: 0,
            }
        }
    }

    impl Connection for StreamConnection {
        fn transfer(&mut self, rx: &mut [u8]) -> transport::Result<()> {
            if self.fail_after == Some(self.transfers) {
                return Err(TransportError::Transfer("bus fault".to_string()));
            }
            self.transfers += 1;
            for slot in rx.chunks_exact_mut(PACKET_SIZE) {
                if self.cursor < self.bytes.len() {
                    slot.copy_from_slice(&self.bytes[self.cursor..self.cursor + PACKET_SIZE]);
                    self.cursor += PACKET_SIZE;
                } else {
                    slot.copy_from_slice(&padding_packet());
                }
            }
            Ok(())
        }

        fn close(self) -> transport::Result<()> {
            Ok(())
        }
    }

    fn numbered_stream(count: u16) -> Vec<u8> {
        (0..count)
            .flat_map(|n| build_packet(n, 0, &[n as u8; 160]))
            .collect()
    }

    #[test]
    fn test_packets_arrive_in_order_without_padding() {
        let mut bytes = numbered_stream(5);
        // Padding between real packets is dropped
        bytes.splice(PACKET_SIZE..PACKET_SIZE, padding_packet());

        let counters = Arc::new(PipelineCounters::default());
        let pipeline = Pipeline::start(
            StreamConnection::new(bytes),
            RingBuffer::new(4, PACKET_SIZE * 3),
            16,
            packet::DEFAULT_DISCARD_MASK,
            None,
            Arc::clone(&counters),
        );

        let numbers: Vec<u16> = (0..5)
            .map(|_| {
                pipeline
                    .recv_timeout(Duration::from_secs(1))
                    .unwrap()
                    .header()
                    .packet_number()
            })
            .collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);

        let exit = pipeline.stop().unwrap();
        assert!(exit.error.is_none());
        assert!(counters.padding.load(Ordering::Relaxed) >= 1);
        assert!(counters.transfers.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_queue_is_bounded() {
        let counters = Arc::new(PipelineCounters::default());
        let pipeline = Pipeline::start(
            StreamConnection::new(numbered_stream(60)),
            RingBuffer::new(8, PACKET_SIZE * 4),
            8,
            packet::DEFAULT_DISCARD_MASK,
            None,
            Arc::clone(&counters),
        );

        // Let the producer fill the queue and block
        thread::sleep(Duration::from_millis(100));
        let read = counters.packets.load(Ordering::Relaxed);
        // Queue holds 8; the producer holds one more in `send` plus the rest of its chunk
        assert!(read <= 8 + 4, "producer ran ahead: {read} packets read");

        // Stop must not hang on the blocked producer
        let exit = pipeline.stop().unwrap();
        assert!(exit.error.is_none());
    }

    #[test]
    fn test_transfer_error_ends_stream() {
        let mut connection = StreamConnection::new(numbered_stream(2));
        connection.fail_after = Some(1);

        let pipeline = Pipeline::start(
            connection,
            RingBuffer::new(2, PACKET_SIZE * 2),
            16,
            packet::DEFAULT_DISCARD_MASK,
            None,
            Arc::new(PipelineCounters::default()),
        );

        assert!(pipeline.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(pipeline.recv_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(
            pipeline.recv_timeout(Duration::from_secs(1)).unwrap_err(),
            RecvTimeoutError::Disconnected
        );
        // The sender drops just before the thread returns
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !pipeline.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(pipeline.is_finished());

        let exit = pipeline.stop().unwrap();
        assert!(matches!(exit.error, Some(TransportError::Transfer(_))));
    }

    #[test]
    fn test_capture_records_every_transfer() {
        let capture = Arc::new(CaptureState::new());
        capture
            .start_capture(crate::capture::CaptureMetadata::default())
            .unwrap();

        let pipeline = Pipeline::start(
            StreamConnection::new(numbered_stream(4)),
            RingBuffer::new(4, PACKET_SIZE * 2),
            16,
            packet::DEFAULT_DISCARD_MASK,
            Some(Arc::clone(&capture)),
            Arc::new(PipelineCounters::default()),
        );
        for _ in 0..4 {
            pipeline.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        pipeline.stop().unwrap();

        assert!(capture.transfer_count() >= 2);
        assert_eq!(
            capture.byte_count(),
            capture.transfer_count() * 2 * PACKET_SIZE as u64
        );
    }
}
