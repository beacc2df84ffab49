//! Shared statistics aggregator.
//!
//! One [`HitProcessor`] exists per pipeline. It is handed out by shared
//! reference to the framer, the decode dispatcher, and its workers; a single
//! internal lock serializes all mutation and snapshotting. Critical sections
//! are short and allocation-free except for the partial-stats merge.

use crate::event::{ChunkMetadata, PixelHit, TdcEvent};
use crate::stats::{PartialStats, RecentHitRing, ReorderStats, Statistics, MAX_CHIPS};
use crate::timing::TOA_TICK_SECONDS;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling rates refresh at most this often.
const RATE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Hits between opportunistic rate refreshes on the hot path.
const RATE_REFRESH_HITS: u64 = 1000;

struct ProcessorState {
    stats: Statistics,
    recent_hits: RecentHitRing,
    last_chunk_metadata: Option<ChunkMetadata>,

    start_time: Option<Instant>,
    last_rate_refresh: Option<Instant>,
    last_hits: u64,
    last_tdc1_events: u64,
    last_latest_hit_ticks: u64,
    last_latest_tdc1_ticks: u64,
}

impl ProcessorState {
    fn new(recent_hit_capacity: usize) -> Self {
        Self {
            stats: Statistics::default(),
            recent_hits: RecentHitRing::new(recent_hit_capacity),
            last_chunk_metadata: None,
            start_time: None,
            last_rate_refresh: None,
            last_hits: 0,
            last_tdc1_events: 0,
            last_latest_hit_ticks: 0,
            last_latest_tdc1_ticks: 0,
        }
    }

    /// Marks the wall-clock start on the first data event and seeds the
    /// rolling-rate snapshots.
    fn note_first_event(&mut self, now: Instant) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
            self.last_rate_refresh = Some(now);
            self.last_hits = self.stats.total_hits;
            self.last_tdc1_events = self.stats.total_tdc1_events;
            self.last_latest_hit_ticks = self.stats.latest_hit_ticks;
            self.last_latest_tdc1_ticks = self.stats.latest_tdc1_ticks;
        }
    }

    fn fold_hit_ticks(&mut self, ticks: u64) {
        let stats = &mut self.stats;
        if stats.hit_ticks_initialized {
            stats.earliest_hit_ticks = stats.earliest_hit_ticks.min(ticks);
            stats.latest_hit_ticks = stats.latest_hit_ticks.max(ticks);
        } else {
            stats.earliest_hit_ticks = ticks;
            stats.latest_hit_ticks = ticks;
            stats.hit_ticks_initialized = true;
        }
    }

    fn fold_tdc1_ticks(&mut self, ticks: u64) {
        let stats = &mut self.stats;
        if stats.tdc1_ticks_initialized {
            stats.earliest_tdc1_ticks = stats.earliest_tdc1_ticks.min(ticks);
            stats.latest_tdc1_ticks = stats.latest_tdc1_ticks.max(ticks);
        } else {
            stats.earliest_tdc1_ticks = ticks;
            stats.latest_tdc1_ticks = ticks;
            stats.tdc1_ticks_initialized = true;
        }
    }

    fn fold_chip_tdc1(&mut self, chip: usize, ticks: u64, count: u64) {
        let stats = &mut self.stats;
        if stats.chip_tdc1_events[chip] == 0 {
            stats.chip_tdc1_min_ticks[chip] = ticks;
            stats.chip_tdc1_max_ticks[chip] = ticks;
        } else {
            stats.chip_tdc1_min_ticks[chip] = stats.chip_tdc1_min_ticks[chip].min(ticks);
            stats.chip_tdc1_max_ticks[chip] = stats.chip_tdc1_max_ticks[chip].max(ticks);
        }
        stats.chip_tdc1_events[chip] += count;
        stats.chip_valid[chip] = true;
    }

    /// Recomputes rolling and cumulative rates.
    ///
    /// Cumulative rates prefer the data span (event tick range) and fall
    /// back to wall-clock time since the first event; rolling rates use the
    /// deltas since the previous refresh with the same preference.
    fn refresh_rates(&mut self, now: Instant, force: bool) {
        let Some(start) = self.start_time else {
            return;
        };
        if !force {
            if let Some(last) = self.last_rate_refresh {
                if now.duration_since(last) < RATE_REFRESH_INTERVAL {
                    return;
                }
            }
        }

        let wall_secs = now.duration_since(start).as_secs_f64();
        let stats = &mut self.stats;

        let hit_span = stats
            .hit_span_seconds()
            .filter(|span| *span > 0.0)
            .unwrap_or(wall_secs);
        if hit_span > 0.0 {
            stats.cumulative_hit_rate_hz = stats.total_hits as f64 / hit_span;
            for chip in 0..MAX_CHIPS {
                if stats.chip_valid[chip] {
                    stats.chip_hit_rates_hz[chip] = stats.chip_hits[chip] as f64 / hit_span;
                }
            }
        }

        let tdc1_span = stats
            .tdc1_span_seconds()
            .filter(|span| *span > 0.0)
            .unwrap_or(wall_secs);
        if tdc1_span > 0.0 {
            stats.cumulative_tdc1_rate_hz = stats.total_tdc1_events as f64 / tdc1_span;
        }
        for chip in 0..MAX_CHIPS {
            if stats.chip_tdc1_events[chip] > 0 {
                let chip_span = (stats.chip_tdc1_max_ticks[chip]
                    - stats.chip_tdc1_min_ticks[chip]) as f64
                    * TOA_TICK_SECONDS;
                let span = if chip_span > 0.0 { chip_span } else { wall_secs };
                if span > 0.0 {
                    stats.chip_tdc1_rates_hz[chip] = stats.chip_tdc1_events[chip] as f64 / span;
                }
            }
        }

        if let Some(last) = self.last_rate_refresh {
            let delta_wall = now.duration_since(last).as_secs_f64();

            let delta_hits = stats.total_hits - self.last_hits;
            let delta_hit_ticks = stats
                .latest_hit_ticks
                .saturating_sub(self.last_latest_hit_ticks);
            let hit_denominator = if delta_hit_ticks > 0 {
                delta_hit_ticks as f64 * TOA_TICK_SECONDS
            } else {
                delta_wall
            };
            if hit_denominator > 0.0 {
                stats.hit_rate_hz = delta_hits as f64 / hit_denominator;
            }

            let delta_tdc1 = stats.total_tdc1_events - self.last_tdc1_events;
            let delta_tdc1_ticks = stats
                .latest_tdc1_ticks
                .saturating_sub(self.last_latest_tdc1_ticks);
            let tdc1_denominator = if delta_tdc1_ticks > 0 {
                delta_tdc1_ticks as f64 * TOA_TICK_SECONDS
            } else {
                delta_wall
            };
            if tdc1_denominator > 0.0 {
                stats.tdc1_rate_hz = delta_tdc1 as f64 / tdc1_denominator;
            }
        }

        self.last_rate_refresh = Some(now);
        self.last_hits = self.stats.total_hits;
        self.last_tdc1_events = self.stats.total_tdc1_events;
        self.last_latest_hit_ticks = self.stats.latest_hit_ticks;
        self.last_latest_tdc1_ticks = self.stats.latest_tdc1_ticks;
    }
}

/// Thread-safe statistics aggregator shared across the pipeline.
pub struct HitProcessor {
    inner: Mutex<ProcessorState>,
}

impl HitProcessor {
    /// Creates an aggregator retaining up to `recent_hit_capacity` hits
    /// (0 disables the recent-hit ring).
    pub fn new(recent_hit_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ProcessorState::new(recent_hit_capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProcessorState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a decoded pixel hit.
    pub fn add_hit(&self, hit: PixelHit) {
        let now = Instant::now();
        let mut state = self.lock();
        state.recent_hits.push(hit);
        state.stats.total_hits += 1;
        let chip = hit.chip_index as usize;
        if chip < MAX_CHIPS {
            state.stats.chip_hits[chip] += 1;
            state.stats.chip_valid[chip] = true;
        }
        state.note_first_event(now);
        state.fold_hit_ticks(hit.toa_ticks);
        if state.stats.total_hits % RATE_REFRESH_HITS == 0 {
            state.refresh_rates(now, false);
        }
    }

    /// Records a decoded TDC event for the given chip.
    pub fn add_tdc(&self, event: &TdcEvent, chip_index: u8) {
        let now = Instant::now();
        let mut state = self.lock();
        state.stats.total_tdc_events += 1;
        state.note_first_event(now);
        if event.kind.is_tdc1() {
            state.stats.total_tdc1_events += 1;
            state.fold_tdc1_ticks(event.timestamp_ticks);
            let chip = chip_index as usize;
            if chip < MAX_CHIPS {
                state.fold_chip_tdc1(chip, event.timestamp_ticks, 1);
            }
        } else {
            state.stats.total_tdc2_events += 1;
        }
        // TDC events are rare compared to hits; refresh opportunistically.
        state.refresh_rates(now, false);
    }

    pub fn increment_chunk_count(&self) {
        self.lock().stats.total_chunks += 1;
    }

    /// Adds several chunk headers at once (framer batches these).
    pub fn increment_chunk_count_batch(&self, count: u64) {
        self.lock().stats.total_chunks += count;
    }

    /// Notes the metadata assembled from a chunk's extra timestamp trailer.
    pub fn process_chunk_metadata(&self, metadata: &ChunkMetadata) {
        self.lock().last_chunk_metadata = Some(*metadata);
    }

    /// Metadata of the most recently completed chunk, if any.
    pub fn last_chunk_metadata(&self) -> Option<ChunkMetadata> {
        self.lock().last_chunk_metadata
    }

    pub fn increment_decode_error(&self) {
        self.lock().stats.total_decode_errors += 1;
    }

    pub fn increment_fractional_error(&self) {
        self.lock().stats.total_fractional_errors += 1;
    }

    pub fn increment_unknown_packet(&self) {
        self.lock().stats.total_unknown_packets += 1;
    }

    pub fn increment_control_packet(&self) {
        self.lock().stats.total_control_packets += 1;
    }

    /// Bumps the histogram bucket for a 4-bit packet type.
    pub fn increment_packet_type(&self, type4: u8) {
        self.lock().stats.packet_type_counts[(type4 & 0xF) as usize] += 1;
    }

    /// Adds a whole histogram delta (framer flushes its local counts).
    pub fn add_packet_type_counts(&self, counts: &[u64; 16]) {
        let mut state = self.lock();
        for (bucket, count) in state.stats.packet_type_counts.iter_mut().zip(counts) {
            *bucket += count;
        }
    }

    /// Replaces the reorder-stats mirror with the buffer's current counters.
    pub fn update_reorder_stats(&self, reorder: ReorderStats) {
        self.lock().stats.reorder = reorder;
    }

    /// Attributes `bytes` to a named packet category.
    pub fn add_packet_bytes(&self, category: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.lock();
        *state
            .stats
            .packet_bytes
            .entry(category.to_owned())
            .or_insert(0) += bytes;
        state.stats.total_bytes_accounted += bytes;
    }

    pub fn add_bytes_dropped_incomplete(&self, bytes: u64) {
        self.lock().stats.bytes_dropped_incomplete += bytes;
    }

    pub fn set_dropped_buffers(&self, dropped: u64) {
        self.lock().stats.dropped_buffers = dropped;
    }

    /// Flags that decoding began in the middle of a chunk. Idempotent.
    pub fn mark_mid_stream_start(&self) {
        self.lock().stats.started_mid_stream = true;
    }

    /// Resizes the recent-hit ring, keeping the newest entries.
    pub fn set_recent_hit_capacity(&self, capacity: usize) {
        self.lock().recent_hits.set_capacity(capacity);
    }

    pub fn recent_hit_capacity(&self) -> usize {
        self.lock().recent_hits.capacity()
    }

    /// Drains a worker's partial stats into the aggregate.
    pub fn merge_partial(&self, partial: &mut PartialStats) {
        if partial.is_empty() && partial.recent_hits.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut state = self.lock();

        state.stats.total_hits += partial.hits;
        state.stats.total_tdc_events += partial.tdc_events;
        state.stats.total_tdc1_events += partial.tdc1_events;
        state.stats.total_tdc2_events += partial.tdc2_events;
        state.stats.total_decode_errors += partial.decode_errors;
        state.stats.total_fractional_errors += partial.fractional_errors;

        for chip in 0..MAX_CHIPS {
            state.stats.chip_hits[chip] += partial.chip_hits[chip];
            if partial.chip_valid[chip] {
                state.stats.chip_valid[chip] = true;
            }
            if partial.chip_tdc1_events[chip] > 0 {
                state.fold_chip_tdc1(
                    chip,
                    partial.chip_tdc1_min_ticks[chip],
                    partial.chip_tdc1_events[chip],
                );
                let max = partial.chip_tdc1_max_ticks[chip];
                state.stats.chip_tdc1_max_ticks[chip] =
                    state.stats.chip_tdc1_max_ticks[chip].max(max);
            }
        }

        if partial.hit_ticks_initialized {
            state.fold_hit_ticks(partial.earliest_hit_ticks);
            state.fold_hit_ticks(partial.latest_hit_ticks);
        }
        if partial.tdc1_ticks_initialized {
            state.fold_tdc1_ticks(partial.earliest_tdc1_ticks);
            state.fold_tdc1_ticks(partial.latest_tdc1_ticks);
        }

        if partial.pixel_bytes > 0 {
            *state
                .stats
                .packet_bytes
                .entry("Pixel data".to_owned())
                .or_insert(0) += partial.pixel_bytes;
            state.stats.total_bytes_accounted += partial.pixel_bytes;
        }
        if partial.tdc_bytes > 0 {
            *state
                .stats
                .packet_bytes
                .entry("TDC event".to_owned())
                .or_insert(0) += partial.tdc_bytes;
            state.stats.total_bytes_accounted += partial.tdc_bytes;
        }

        for hit in partial.recent_hits.drain(..) {
            state.recent_hits.push(hit);
        }

        if partial.hits > 0 || partial.tdc_events > 0 {
            state.note_first_event(now);
            state.refresh_rates(now, false);
        }

        partial.reset();
    }

    /// Forces a rate refresh and imputes any rate that is still zero but
    /// has a positive data span to back it.
    pub fn finalize_rates(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.refresh_rates(now, true);

        let stats = &mut state.stats;
        if let Some(span) = stats.hit_span_seconds().filter(|s| *s > 0.0) {
            if stats.hit_rate_hz == 0.0 && stats.total_hits > 0 {
                stats.hit_rate_hz = stats.total_hits as f64 / span;
            }
            if stats.cumulative_hit_rate_hz == 0.0 && stats.total_hits > 0 {
                stats.cumulative_hit_rate_hz = stats.total_hits as f64 / span;
            }
        }
        if let Some(span) = stats.tdc1_span_seconds().filter(|s| *s > 0.0) {
            if stats.tdc1_rate_hz == 0.0 && stats.total_tdc1_events > 0 {
                stats.tdc1_rate_hz = stats.total_tdc1_events as f64 / span;
            }
            if stats.cumulative_tdc1_rate_hz == 0.0 && stats.total_tdc1_events > 0 {
                stats.cumulative_tdc1_rate_hz = stats.total_tdc1_events as f64 / span;
            }
        }
    }

    /// Deep snapshot of the current statistics.
    pub fn get_statistics(&self) -> Statistics {
        self.lock().stats.clone()
    }

    /// Recent hits in chronological order.
    pub fn get_recent_hits(&self) -> Vec<PixelHit> {
        self.lock().recent_hits.snapshot()
    }

    /// Empties the recent-hit ring without touching counters.
    pub fn clear_hits(&self) {
        self.lock().recent_hits.clear();
    }

    /// Resets every counter, rate, and the recent-hit ring.
    pub fn reset_statistics(&self) {
        let mut state = self.lock();
        let capacity = state.recent_hits.capacity();
        *state = ProcessorState::new(capacity);
    }
}
