//! Fixed arena of reusable transfer chunks
//!
//! Each bus transfer reads hundreds of packets into one chunk. Chunks are
//! handed out round-robin so the streaming loop does not allocate per
//! transfer.
//!
//! Packet views ([`PacketRef`]) hold a reference count on their chunk. When
//! the round-robin cursor reaches a chunk that is still referenced
//! downstream, the ring swaps in a freshly allocated chunk instead of
//! overwriting live packets, and counts a recycle miss. A correctly sized
//! ring never misses; see [`RingBuffer::chunks_for`].

use std::sync::Arc;

use crate::packet::{PacketRef, PACKET_SIZE};

/// Round-robin arena of equally sized byte chunks
pub struct RingBuffer {
    chunks: Vec<Arc<[u8]>>,
    chunk_size: usize,
    cursor: usize,
    recycle_misses: u64,
}

impl RingBuffer {
    /// Create a ring of `num_chunks` zeroed chunks of `chunk_size` bytes.
    ///
    /// Both values are clamped to at least 1.
    pub fn new(num_chunks: usize, chunk_size: usize) -> Self {
        let num_chunks = num_chunks.max(1);
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Arc<[u8]>> = (0..num_chunks)
            .map(|_| Arc::from(vec![0u8; chunk_size]))
            .collect();

        Self {
            chunks,
            chunk_size,
            cursor: 0,
            recycle_misses: 0,
        }
    }

    /// Create a ring sized to hold every transfer of one frame window.
    ///
    /// Chunks hold `packets_per_transfer` packets each; the chunk count is
    /// `ceil(max_packets_per_frame / packets_per_transfer)`.
    pub fn for_transfers(packets_per_transfer: usize, max_packets_per_frame: usize) -> Self {
        Self::new(
            Self::chunks_for(packets_per_transfer, max_packets_per_frame),
            packets_per_transfer.max(1) * PACKET_SIZE,
        )
    }

    /// Number of chunks needed to cover `max_packets_per_frame` packets
    pub fn chunks_for(packets_per_transfer: usize, max_packets_per_frame: usize) -> usize {
        max_packets_per_frame
            .div_ceil(packets_per_transfer.max(1))
            .max(1)
    }

    /// Number of chunks in the ring
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Size of each chunk in bytes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks that were still referenced when their turn came round
    pub fn recycle_misses(&self) -> u64 {
        self.recycle_misses
    }

    /// Take the next chunk for writing.
    ///
    /// The returned chunk is never shared with a live packet view.
    pub fn next_chunk(&mut self) -> Chunk<'_> {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.chunks.len();

        if Arc::get_mut(&mut self.chunks[index]).is_none() {
            self.recycle_misses += 1;
            log::warn!(
                "Ring chunk {} still referenced by {} packet views, allocating replacement (miss #{})",
                index,
                Arc::strong_count(&self.chunks[index]) - 1,
                self.recycle_misses
            );
            self.chunks[index] = Arc::from(vec![0u8; self.chunk_size]);
        }

        Chunk {
            slot: &mut self.chunks[index],
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("num_chunks", &self.chunks.len())
            .field("chunk_size", &self.chunk_size)
            .field("cursor", &self.cursor)
            .field("recycle_misses", &self.recycle_misses)
            .finish()
    }
}

/// A chunk checked out of the ring for one transfer
pub struct Chunk<'a> {
    slot: &'a mut Arc<[u8]>,
}

impl Chunk<'_> {
    /// Writable chunk bytes.
    ///
    /// Must be called before any packet views are taken from this chunk;
    /// afterwards the bytes are shared and writing would copy the chunk.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Unique after `next_chunk`, so this never clones in practice.
        Arc::make_mut(self.slot)
    }

    /// Read-only chunk bytes
    pub fn bytes(&self) -> &[u8] {
        &self.slot[..]
    }

    /// Views of every whole packet in the chunk, in order
    pub fn packets(&self) -> impl Iterator<Item = PacketRef> + '_ {
        (0..self.slot.len() / PACKET_SIZE)
            .filter_map(move |i| PacketRef::new(Arc::clone(&*self.slot), i * PACKET_SIZE))
    }
}
