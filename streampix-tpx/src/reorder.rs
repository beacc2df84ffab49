//! Reordering of sequence-numbered SPIDR packets.
//!
//! SPIDR packet id words (0x50) carry a 48-bit sequence number. Network
//! reordering can deliver them out of order within a chunk; this buffer
//! re-emits them in strictly increasing id order up to a bounded window.
//! Packets older than the window are dropped; when the window is full,
//! ahead-of-sequence packets bypass ordering and are emitted directly.

use std::collections::HashMap;
use streampix_core::stats::ReorderStats;

/// A packet parked while waiting for its predecessors.
#[derive(Debug, Clone, Copy)]
struct BufferedPacket {
    word: u64,
    packet_id: u64,
    chunk_id: u64,
}

/// Bounded, chunk-aware reorder buffer for SPIDR packet ids.
///
/// Emission happens through the callback passed to [`process_packet`] and
/// [`flush`], always on the calling thread.
///
/// [`process_packet`]: PacketReorderBuffer::process_packet
/// [`flush`]: PacketReorderBuffer::flush
pub struct PacketReorderBuffer {
    buffer: HashMap<u64, BufferedPacket>,
    max_buffer_size: usize,
    chunk_aware: bool,

    next_expected_id: u64,
    oldest_allowed_id: u64,
    current_chunk_id: u64,
    first_packet_seen: bool,

    stats: ReorderStats,
}

impl PacketReorderBuffer {
    /// Default reordering window.
    pub const DEFAULT_WINDOW: usize = 1000;

    pub fn new(max_buffer_size: usize, chunk_aware: bool) -> Self {
        Self {
            buffer: HashMap::new(),
            max_buffer_size,
            chunk_aware,
            next_expected_id: 0,
            oldest_allowed_id: 0,
            current_chunk_id: 0,
            first_packet_seen: false,
            stats: ReorderStats::default(),
        }
    }

    /// Feeds one packet through the buffer.
    ///
    /// Returns true if the packet was emitted immediately (in order); false
    /// if it was buffered, dropped, or emitted out of order via the
    /// overflow bypass.
    pub fn process_packet(
        &mut self,
        word: u64,
        packet_id: u64,
        chunk_id: u64,
        callback: &mut impl FnMut(u64, u64, u64),
    ) -> bool {
        self.stats.total_packets += 1;

        // Chunk boundary: flush leftovers from the previous chunk in order,
        // then restart the sequence.
        if self.chunk_aware && chunk_id != self.current_chunk_id && chunk_id > 0 {
            self.flush(callback);
            self.reset_for_new_chunk(chunk_id);
        }

        // Fast path: the id we were waiting for.
        if !self.first_packet_seen || packet_id == self.next_expected_id {
            if !self.first_packet_seen {
                self.first_packet_seen = true;
                self.next_expected_id = packet_id + 1;
                self.oldest_allowed_id = packet_id.saturating_sub(self.max_buffer_size as u64);
            } else {
                self.next_expected_id += 1;
                self.update_oldest_allowed();
            }
            self.stats.packets_processed_immediately += 1;
            callback(word, packet_id, chunk_id);
            return true;
        }

        // Behind the window: duplicate or stale, drop.
        if packet_id < self.oldest_allowed_id {
            self.stats.packets_dropped_too_old += 1;
            return false;
        }

        if packet_id > self.next_expected_id {
            // Ahead of sequence.
            let distance = packet_id - self.next_expected_id;
            self.stats.max_reorder_distance = self.stats.max_reorder_distance.max(distance);

            if self.buffer.len() >= self.max_buffer_size {
                self.stats.buffer_overflows += 1;
                // Emit unordered rather than stall the stream.
                callback(word, packet_id, chunk_id);
                return false;
            }

            self.buffer.insert(
                packet_id,
                BufferedPacket {
                    word,
                    packet_id,
                    chunk_id,
                },
            );
            self.stats.packets_reordered += 1;
            self.release_consecutive(callback);
            return false;
        }

        // Late arrival inside the window.
        let distance = self.next_expected_id - packet_id - 1;
        self.stats.max_reorder_distance = self.stats.max_reorder_distance.max(distance);

        if self.buffer.len() >= self.max_buffer_size {
            self.stats.buffer_overflows += 1;
            // A late packet cannot recover its slot once the window is
            // full, so it is dropped rather than emitted out of order.
            return false;
        }

        self.buffer.insert(
            packet_id,
            BufferedPacket {
                word,
                packet_id,
                chunk_id,
            },
        );
        self.stats.packets_reordered += 1;
        self.release_consecutive(callback);
        false
    }

    /// Emits buffered packets whose ids are now consecutive from
    /// `next_expected_id`.
    fn release_consecutive(&mut self, callback: &mut impl FnMut(u64, u64, u64)) {
        while let Some(packet) = self.buffer.remove(&self.next_expected_id) {
            callback(packet.word, packet.packet_id, packet.chunk_id);
            self.next_expected_id += 1;
            self.update_oldest_allowed();
        }
    }

    /// Emits everything still buffered in ascending id order, gaps and all,
    /// then resets the sequence state.
    pub fn flush(&mut self, callback: &mut impl FnMut(u64, u64, u64)) {
        if !self.buffer.is_empty() {
            let mut ids: Vec<u64> = self.buffer.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                let packet = self.buffer[&id];
                callback(packet.word, packet.packet_id, packet.chunk_id);
            }
            self.buffer.clear();
        }
        self.first_packet_seen = false;
        self.next_expected_id = 0;
        self.oldest_allowed_id = 0;
    }

    /// Discards any buffered packets and restarts the sequence for a new
    /// chunk.
    pub fn reset_for_new_chunk(&mut self, new_chunk_id: u64) {
        self.buffer.clear();
        self.current_chunk_id = new_chunk_id;
        self.first_packet_seen = false;
        self.next_expected_id = 0;
        self.oldest_allowed_id = 0;
    }

    fn update_oldest_allowed(&mut self) {
        self.oldest_allowed_id = self
            .next_expected_id
            .saturating_sub(self.max_buffer_size as u64);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ReorderStats::default();
    }
}
