//! Statistics snapshot types and worker-local partial accumulators.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::event::{PixelHit, TdcEvent};
use std::collections::BTreeMap;

/// Number of chips tracked with fixed per-chip arrays. Hits from higher
/// chip indices still count toward the global totals.
pub const MAX_CHIPS: usize = 4;

/// Counters produced by the packet reorder buffer, mirrored into the
/// statistics snapshot at framer flush points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReorderStats {
    /// Packets that were buffered before emission.
    pub packets_reordered: u64,
    /// Packets emitted on the fast path, in arrival order.
    pub packets_processed_immediately: u64,
    /// Largest observed gap from the expected packet id.
    pub max_reorder_distance: u64,
    /// Packets that could not be buffered because the window was full.
    pub buffer_overflows: u64,
    /// Packets older than the reorder window, dropped.
    pub packets_dropped_too_old: u64,
    /// Every packet the reorder buffer has seen.
    pub total_packets: u64,
}

/// Aggregate statistics for a processing run.
///
/// All counters are monotone between resets. Rates are derived at refresh
/// time from the data span (event timestamps) where available, falling back
/// to wall-clock time.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Statistics {
    pub total_hits: u64,
    pub total_chunks: u64,
    pub total_tdc_events: u64,
    pub total_tdc1_events: u64,
    pub total_tdc2_events: u64,
    pub total_control_packets: u64,
    pub total_decode_errors: u64,
    pub total_fractional_errors: u64,
    pub total_unknown_packets: u64,

    /// Histogram keyed by the 4-bit packet type nibble.
    pub packet_type_counts: [u64; 16],

    /// Per-chip hit totals.
    pub chip_hits: [u64; MAX_CHIPS],
    /// Per-chip TDC1 event totals.
    pub chip_tdc1_events: [u64; MAX_CHIPS],
    /// Per-chip earliest TDC1 tick.
    pub chip_tdc1_min_ticks: [u64; MAX_CHIPS],
    /// Per-chip latest TDC1 tick.
    pub chip_tdc1_max_ticks: [u64; MAX_CHIPS],
    /// True once data for the chip has been observed.
    pub chip_valid: [bool; MAX_CHIPS],

    pub earliest_hit_ticks: u64,
    pub latest_hit_ticks: u64,
    pub hit_ticks_initialized: bool,

    pub earliest_tdc1_ticks: u64,
    pub latest_tdc1_ticks: u64,
    pub tdc1_ticks_initialized: bool,

    /// Rolling hit rate (updated at most once per wall-clock second).
    pub hit_rate_hz: f64,
    /// Cumulative hit rate over the whole run.
    pub cumulative_hit_rate_hz: f64,
    /// Rolling TDC1 trigger rate.
    pub tdc1_rate_hz: f64,
    /// Cumulative TDC1 trigger rate.
    pub cumulative_tdc1_rate_hz: f64,
    /// Per-chip cumulative hit rates.
    pub chip_hit_rates_hz: [f64; MAX_CHIPS],
    /// Per-chip cumulative TDC1 rates, from per-chip tick spans.
    pub chip_tdc1_rates_hz: [f64; MAX_CHIPS],

    /// Reorder buffer counters (zero when reordering is disabled).
    pub reorder: ReorderStats,

    /// Bytes attributed per packet category.
    pub packet_bytes: BTreeMap<String, u64>,
    /// Grand total of all accounted bytes.
    pub total_bytes_accounted: u64,
    /// Trailing bytes that did not form a whole 64-bit word.
    pub bytes_dropped_incomplete: u64,

    /// Input buffers evicted from the ingest queue under backpressure.
    pub dropped_buffers: u64,

    /// True if the stream began mid-chunk (data before the first header).
    pub started_mid_stream: bool,
}

impl Statistics {
    /// Data span covered by pixel hits, in seconds, if any hits were seen.
    pub fn hit_span_seconds(&self) -> Option<f64> {
        self.hit_ticks_initialized.then(|| {
            (self.latest_hit_ticks - self.earliest_hit_ticks) as f64
                * crate::timing::TOA_TICK_SECONDS
        })
    }

    /// Data span covered by TDC1 triggers, in seconds.
    pub fn tdc1_span_seconds(&self) -> Option<f64> {
        self.tdc1_ticks_initialized.then(|| {
            (self.latest_tdc1_ticks - self.earliest_tdc1_ticks) as f64
                * crate::timing::TOA_TICK_SECONDS
        })
    }
}

/// Decoder-worker private accumulator.
///
/// Workers update their own `PartialStats` without touching the shared
/// aggregate; [`crate::processor::HitProcessor::merge_partial`] drains one
/// under the aggregator lock at flush points.
#[derive(Debug, Clone, Default)]
pub struct PartialStats {
    pub hits: u64,
    pub chip_hits: [u64; MAX_CHIPS],
    pub tdc_events: u64,
    pub tdc1_events: u64,
    pub tdc2_events: u64,
    pub chip_tdc1_events: [u64; MAX_CHIPS],
    pub chip_tdc1_min_ticks: [u64; MAX_CHIPS],
    pub chip_tdc1_max_ticks: [u64; MAX_CHIPS],
    pub chip_valid: [bool; MAX_CHIPS],

    pub earliest_hit_ticks: u64,
    pub latest_hit_ticks: u64,
    pub hit_ticks_initialized: bool,
    pub earliest_tdc1_ticks: u64,
    pub latest_tdc1_ticks: u64,
    pub tdc1_ticks_initialized: bool,

    pub decode_errors: u64,
    pub fractional_errors: u64,

    /// Bytes decoded as pixel data / TDC events on the worker hot path.
    pub pixel_bytes: u64,
    pub tdc_bytes: u64,

    /// Most recent hits, bounded by the aggregator's ring capacity.
    pub recent_hits: Vec<PixelHit>,
    pub recent_capacity: usize,
}

impl PartialStats {
    /// Creates an accumulator whose recent-hit buffer matches the
    /// aggregator's ring capacity.
    pub fn with_recent_capacity(capacity: usize) -> Self {
        Self {
            recent_capacity: capacity,
            ..Self::default()
        }
    }

    /// Records one decoded pixel hit.
    pub fn record_hit(&mut self, hit: PixelHit) {
        self.hits += 1;
        let chip = hit.chip_index as usize;
        if chip < MAX_CHIPS {
            self.chip_hits[chip] += 1;
            self.chip_valid[chip] = true;
        }
        if self.hit_ticks_initialized {
            self.earliest_hit_ticks = self.earliest_hit_ticks.min(hit.toa_ticks);
            self.latest_hit_ticks = self.latest_hit_ticks.max(hit.toa_ticks);
        } else {
            self.earliest_hit_ticks = hit.toa_ticks;
            self.latest_hit_ticks = hit.toa_ticks;
            self.hit_ticks_initialized = true;
        }
        if self.recent_capacity > 0 {
            if self.recent_hits.len() == self.recent_capacity {
                self.recent_hits.remove(0);
            }
            self.recent_hits.push(hit);
        }
    }

    /// Records one decoded TDC event.
    pub fn record_tdc(&mut self, event: &TdcEvent, chip_index: u8) {
        self.tdc_events += 1;
        if event.kind.is_tdc1() {
            self.tdc1_events += 1;
            let ticks = event.timestamp_ticks;
            if self.tdc1_ticks_initialized {
                self.earliest_tdc1_ticks = self.earliest_tdc1_ticks.min(ticks);
                self.latest_tdc1_ticks = self.latest_tdc1_ticks.max(ticks);
            } else {
                self.earliest_tdc1_ticks = ticks;
                self.latest_tdc1_ticks = ticks;
                self.tdc1_ticks_initialized = true;
            }
            let chip = chip_index as usize;
            if chip < MAX_CHIPS {
                self.chip_valid[chip] = true;
                if self.chip_tdc1_events[chip] == 0 {
                    self.chip_tdc1_min_ticks[chip] = ticks;
                    self.chip_tdc1_max_ticks[chip] = ticks;
                } else {
                    self.chip_tdc1_min_ticks[chip] = self.chip_tdc1_min_ticks[chip].min(ticks);
                    self.chip_tdc1_max_ticks[chip] = self.chip_tdc1_max_ticks[chip].max(ticks);
                }
                self.chip_tdc1_events[chip] += 1;
            }
        } else {
            self.tdc2_events += 1;
        }
    }

    /// True if nothing has been accumulated since the last drain.
    pub fn is_empty(&self) -> bool {
        self.hits == 0
            && self.tdc_events == 0
            && self.decode_errors == 0
            && self.fractional_errors == 0
            && self.pixel_bytes == 0
            && self.tdc_bytes == 0
    }

    /// Clears all accumulated values, keeping the configured capacity.
    pub fn reset(&mut self) {
        let capacity = self.recent_capacity;
        *self = Self::with_recent_capacity(capacity);
    }
}

/// Fixed-capacity chronological ring of the most recent hits.
#[derive(Debug, Clone, Default)]
pub struct RecentHitRing {
    buf: std::collections::VecDeque<PixelHit>,
    capacity: usize,
}

impl RecentHitRing {
    /// Capacity 0 disables retention entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends a hit, evicting the oldest when full.
    pub fn push(&mut self, hit: PixelHit) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(hit);
    }

    /// Contents in chronological order (oldest first).
    pub fn snapshot(&self) -> Vec<PixelHit> {
        self.buf.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Changes the capacity, keeping the newest entries that still fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.buf.len() > capacity {
            self.buf.pop_front();
        }
    }
}
