//! Decoded event records for TPX3/SPIDR streams.
//!
//! These are the typed results of decoding 64-bit wire words. The bit-level
//! decoders themselves live in `streampix-tpx`; this crate only defines the
//! records so that the statistics aggregator can consume them without
//! depending on the wire format.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A single pixel activation event.
///
/// Coordinates are local to the chip (0-255 for TPX3). `toa_ticks` is in
/// 1.5625 ns units (640 MHz reference clock) and may have been widened by
/// the timestamp extender; `tot_ns` is already converted from the raw
/// 25 ns-unit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelHit {
    /// Pixel X coordinate.
    pub x: u16,
    /// Pixel Y coordinate.
    pub y: u16,
    /// Time of arrival in 1.5625 ns ticks.
    pub toa_ticks: u64,
    /// Time over threshold in nanoseconds.
    pub tot_ns: u16,
    /// Chip the hit originated from.
    pub chip_index: u8,
    /// True if decoded from a count_fb mode packet (type 0xA).
    pub is_count_fb: bool,
}

impl PixelHit {
    /// ToA in nanoseconds.
    pub fn toa_ns(&self) -> f64 {
        self.toa_ticks as f64 * 1.5625
    }
}

/// TDC trigger edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TdcEventKind {
    /// TDC1 rising edge (subtype 0xF).
    Tdc1Rising,
    /// TDC1 falling edge (subtype 0xA).
    Tdc1Falling,
    /// TDC2 rising edge (subtype 0xE).
    Tdc2Rising,
    /// TDC2 falling edge (subtype 0xB).
    Tdc2Falling,
}

impl TdcEventKind {
    /// True for either TDC1 edge.
    pub fn is_tdc1(self) -> bool {
        matches!(self, TdcEventKind::Tdc1Rising | TdcEventKind::Tdc1Falling)
    }

    /// True for either TDC2 edge.
    pub fn is_tdc2(self) -> bool {
        matches!(self, TdcEventKind::Tdc2Rising | TdcEventKind::Tdc2Falling)
    }
}

/// A TDC trigger timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TdcEvent {
    /// Which TDC input and edge produced the event.
    pub kind: TdcEventKind,
    /// 12-bit trigger counter.
    pub trigger_count: u16,
    /// Timestamp in 1.5625 ns ticks.
    pub timestamp_ticks: u64,
    /// Fine fraction 1..=12. Legacy firmware emits 0, which decoders coerce to 1.
    pub fine: u8,
}

/// SPIDR control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SpidrControlCmd {
    /// Shutter opened (0xF).
    ShutterOpen,
    /// Shutter closed (0xA).
    ShutterClose,
    /// Heartbeat (0xC).
    Heartbeat,
}

/// A decoded SPIDR control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpidrControl {
    pub command: SpidrControlCmd,
    /// Timestamp in 25 ns units.
    pub timestamp_25ns: u64,
}

/// TPX3 control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Tpx3ControlCmd {
    /// End of sequential readout (0xA0).
    EndSequential,
    /// End of data-driven readout (0xB0).
    EndDataDriven,
}

/// Global time packet (low word 0x44 or high word 0x45).
///
/// Tallied for accounting; the value is not applied to hit timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlobalTime {
    /// True for the high word (0x45, ~107.374 s units), false for the low
    /// word (0x44, 25 ns units).
    pub is_high_word: bool,
    /// Time value in the unit implied by `is_high_word`.
    pub time_value: u32,
    /// SPIDR time in 0.4096 ms units.
    pub spidr_time: u16,
}

/// End-of-chunk extra timestamp packet (0x51 TPX3 / 0x21 MPX3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtraTimestamp {
    /// True for TPX3 (0x51), false for MPX3 (0x21).
    pub is_tpx3: bool,
    pub error_flag: bool,
    pub overflow_flag: bool,
    /// 54-bit timestamp in 1.5625 ns ticks.
    pub timestamp_ticks: u64,
}

/// Per-chunk metadata assembled from the three trailing extra timestamp
/// packets, in wire order [packet generation time, minimum, maximum].
///
/// `min_timestamp` anchors 30-bit timestamp extension for pixel hits in the
/// chunk. Reset at every chunk header; `has_extra_packets` only becomes true
/// once all three packets have been seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkMetadata {
    /// Chunk generation timestamp in 1.5625 ns ticks.
    pub packet_gen_time: u64,
    /// Minimum event timestamp in the chunk.
    pub min_timestamp: u64,
    /// Maximum event timestamp in the chunk.
    pub max_timestamp: u64,
    /// True once all three extra packets were decoded for this chunk.
    pub has_extra_packets: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tdc_kind_classification() {
        assert!(TdcEventKind::Tdc1Rising.is_tdc1());
        assert!(TdcEventKind::Tdc1Falling.is_tdc1());
        assert!(!TdcEventKind::Tdc1Rising.is_tdc2());
        assert!(TdcEventKind::Tdc2Rising.is_tdc2());
        assert!(TdcEventKind::Tdc2Falling.is_tdc2());
        assert!(!TdcEventKind::Tdc2Falling.is_tdc1());
    }

    #[test]
    fn test_hit_toa_ns() {
        let hit = PixelHit {
            x: 10,
            y: 20,
            toa_ticks: 64,
            tot_ns: 100,
            chip_index: 0,
            is_count_fb: false,
        };
        // 64 * 1.5625 = 100 ns
        assert!((hit.toa_ns() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_chunk_metadata_default_invalid() {
        let meta = ChunkMetadata::default();
        assert!(!meta.has_extra_packets);
    }
}
