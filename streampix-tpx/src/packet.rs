//! TPX3/SPIDR packet classification and decoding.
//!
//! Every stream word is 64 bits, little-endian on the wire. Classification
//! consults the top byte first (full-byte codes 0x44/0x45/0x50/0x51/0x21/0x71
//! define specific packets) and falls back to the top nibble.

use crate::bitfield::{bits, pixaddr_to_xy};
use crate::{Error, Result};
use streampix_core::event::{
    ExtraTimestamp, GlobalTime, PixelHit, SpidrControl, SpidrControlCmd, TdcEvent, TdcEventKind,
    Tpx3ControlCmd,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 'TPX3' in little-endian, the low 32 bits of every chunk header word.
pub const TPX3_MAGIC: u64 = 0x3358_5054;

/// Classified packet kind, before decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PacketKind {
    /// Pixel data in count_fb mode (nibble 0xA).
    PixelCountFb,
    /// Pixel data in standard data-driven mode (nibble 0xB).
    PixelStandard,
    /// TDC trigger data (nibble 0x6).
    Tdc,
    /// Global time low word (byte 0x44).
    GlobalTimeLow,
    /// Global time high word (byte 0x45).
    GlobalTimeHigh,
    /// SPIDR packet sequence id (byte 0x50).
    SpidrId,
    /// SPIDR control command (nibble 0x5).
    SpidrControl,
    /// TPX3 control command (byte 0x71).
    Tpx3Control,
    /// End-of-chunk extra timestamp (byte 0x51 TPX3 / 0x21 MPX3).
    ExtraTimestamp,
    /// Unrecognized top byte and nibble.
    Unknown,
}

impl PacketKind {
    /// Classifies a raw stream word. Full-byte codes win over the nibble.
    #[inline]
    pub fn of(word: u64) -> Self {
        match (word >> 56) as u8 {
            0x44 => PacketKind::GlobalTimeLow,
            0x45 => PacketKind::GlobalTimeHigh,
            0x50 => PacketKind::SpidrId,
            0x51 | 0x21 => PacketKind::ExtraTimestamp,
            0x71 => PacketKind::Tpx3Control,
            byte => match byte >> 4 {
                0xA => PacketKind::PixelCountFb,
                0xB => PacketKind::PixelStandard,
                0x6 => PacketKind::Tdc,
                0x5 => PacketKind::SpidrControl,
                _ => PacketKind::Unknown,
            },
        }
    }

    /// Byte-accounting category label for this kind.
    pub fn label(&self) -> &'static str {
        match self {
            PacketKind::PixelCountFb | PacketKind::PixelStandard => "Pixel data",
            PacketKind::Tdc => "TDC event",
            PacketKind::GlobalTimeLow | PacketKind::GlobalTimeHigh => "Global time",
            PacketKind::SpidrId => "SPIDR packet ID",
            PacketKind::SpidrControl => "SPIDR control",
            PacketKind::Tpx3Control => "TPX3 control",
            PacketKind::ExtraTimestamp => "Extra timestamp",
            PacketKind::Unknown => "Unknown",
        }
    }
}

/// A chunk header word: magic in the low 32 bits, chip index and byte size
/// in the upper fields. The size is inclusive of the header word itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkHeader {
    raw: u64,
}

impl ChunkHeader {
    /// True if the word carries the TPX3 magic.
    #[inline]
    pub fn is_header(word: u64) -> bool {
        word & 0xFFFF_FFFF == TPX3_MAGIC
    }

    pub fn new(raw: u64) -> Self {
        Self { raw }
    }

    /// Chunk size in bytes (bits 48..63), header word included.
    pub fn chunk_size_bytes(&self) -> u16 {
        bits(self.raw, 63, 48) as u16
    }

    /// Chip index (bits 32..39).
    pub fn chip_index(&self) -> u8 {
        bits(self.raw, 39, 32) as u8
    }

    /// Chunk length in 64-bit words, header included.
    pub fn word_count(&self) -> usize {
        usize::from(self.chunk_size_bytes()) / 8
    }

    /// Checks the size invariant: a multiple of 8 and at least one word.
    pub fn validate(&self) -> Result<()> {
        let size = self.chunk_size_bytes();
        if size < 8 || size % 8 != 0 {
            return Err(Error::InvalidChunkSize(size));
        }
        Ok(())
    }
}

/// Decodes a pixel data word, dispatching on the mode nibble.
pub fn decode_pixel(word: u64, chip_index: u8) -> Result<PixelHit> {
    match (word >> 60) as u8 {
        0xA => Ok(decode_pixel_count_fb(word, chip_index)),
        0xB => Ok(decode_pixel_standard(word, chip_index)),
        nibble => Err(Error::InvalidPixelType(nibble)),
    }
}

/// Decodes a standard data-driven pixel word (type 0xB).
///
/// ToA is assembled as `((spidr << 14) + toa) << 4 - ftoa` in 1.5625 ns
/// ticks; unsigned wrap is fine because the timestamp extender restores
/// true ordering downstream.
pub fn decode_pixel_standard(word: u64, chip_index: u8) -> PixelHit {
    let pixaddr = bits(word, 59, 44);
    let (x, y) = pixaddr_to_xy(pixaddr);

    let toa = bits(word, 43, 30);
    let tot = bits(word, 29, 20);
    let ftoa = bits(word, 19, 16);
    let spidr = bits(word, 15, 0);

    let toa_ticks = (((spidr << 14) + toa) << 4).wrapping_sub(ftoa);

    PixelHit {
        x,
        y,
        toa_ticks,
        tot_ns: (tot * 25) as u16,
        chip_index,
        is_count_fb: false,
    }
}

/// Decodes a count_fb mode pixel word (type 0xA).
///
/// The field at bits 43..30 is the integrated ToT and bits 29..20 carry the
/// event count; the 4-bit hit count at 19..16 is unused.
pub fn decode_pixel_count_fb(word: u64, chip_index: u8) -> PixelHit {
    let pixaddr = bits(word, 59, 44);
    let (x, y) = pixaddr_to_xy(pixaddr);

    let integrated_tot = bits(word, 43, 30);
    let event_count = bits(word, 29, 20);
    let spidr = bits(word, 15, 0);

    let toa_ticks = ((spidr << 14) + event_count) << 4;

    PixelHit {
        x,
        y,
        toa_ticks,
        tot_ns: (integrated_tot * 25) as u16,
        chip_index,
        is_count_fb: true,
    }
}

/// Decodes a TDC trigger word (type 0x6).
///
/// The fine fraction is nominally 1..=12; old firmware emits 0, which is
/// coerced to 1. The coarse field is in 3.125 ns units, so the combined
/// timestamp is `(coarse << 1) | ((fine - 1) / 6)` in 1.5625 ns ticks.
pub fn decode_tdc(word: u64) -> Result<TdcEvent> {
    let event_type = bits(word, 59, 56) as u8;
    let kind = match event_type {
        0xF => TdcEventKind::Tdc1Rising,
        0xA => TdcEventKind::Tdc1Falling,
        0xE => TdcEventKind::Tdc2Rising,
        0xB => TdcEventKind::Tdc2Falling,
        other => return Err(Error::InvalidTdcType(other)),
    };

    let trigger_count = bits(word, 55, 44) as u16;
    let coarse = bits(word, 43, 9);
    let mut fine = bits(word, 8, 5) as u8;

    if fine == 0 {
        fine = 1;
    } else if fine > 12 {
        return Err(Error::InvalidFractional(fine));
    }

    let timestamp_ticks = (coarse << 1) | u64::from((fine - 1) / 6);

    Ok(TdcEvent {
        kind,
        trigger_count,
        timestamp_ticks,
        fine,
    })
}

/// Decodes a global time word (0x44 low / 0x45 high), or `None` if the top
/// byte is neither.
pub fn decode_global_time(word: u64) -> Option<GlobalTime> {
    let spidr_time = bits(word, 15, 0) as u16;
    match (word >> 56) as u8 {
        0x44 => Some(GlobalTime {
            is_high_word: false,
            time_value: bits(word, 47, 16) as u32,
            spidr_time,
        }),
        0x45 => Some(GlobalTime {
            is_high_word: true,
            time_value: bits(word, 31, 16) as u32,
            spidr_time,
        }),
        _ => None,
    }
}

/// Extracts the 48-bit packet count from a SPIDR packet id word (0x50).
pub fn decode_spidr_packet_id(word: u64) -> Option<u64> {
    if (word >> 56) as u8 != 0x50 {
        return None;
    }
    Some(bits(word, 47, 0))
}

/// Decodes a SPIDR control word (nibble 0x5), or `None` for an unknown
/// command.
pub fn decode_spidr_control(word: u64) -> Option<SpidrControl> {
    if (word >> 60) as u8 != 0x5 {
        return None;
    }
    let command = match bits(word, 59, 56) as u8 {
        0xF => SpidrControlCmd::ShutterOpen,
        0xA => SpidrControlCmd::ShutterClose,
        0xC => SpidrControlCmd::Heartbeat,
        _ => return None,
    };
    Some(SpidrControl {
        command,
        timestamp_25ns: bits(word, 45, 12),
    })
}

/// Decodes a TPX3 control word (byte 0x71), or `None` for an unknown
/// command.
pub fn decode_tpx3_control(word: u64) -> Option<Tpx3ControlCmd> {
    if (word >> 56) as u8 != 0x71 {
        return None;
    }
    match bits(word, 55, 48) as u8 {
        0xA0 => Some(Tpx3ControlCmd::EndSequential),
        0xB0 => Some(Tpx3ControlCmd::EndDataDriven),
        _ => None,
    }
}

/// Decodes an extra timestamp word (0x51/0x21).
pub fn decode_extra_timestamp(word: u64) -> ExtraTimestamp {
    ExtraTimestamp {
        is_tpx3: (word >> 56) as u8 == 0x51,
        error_flag: bits(word, 55, 55) != 0,
        overflow_flag: bits(word, 54, 54) != 0,
        timestamp_ticks: bits(word, 53, 0),
    }
}

/// A fully decoded stream word.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DecodedPacket {
    ChunkHeader(ChunkHeader),
    Hit(PixelHit),
    Tdc(TdcEvent),
    GlobalTime(GlobalTime),
    SpidrId { packet_count: u64 },
    SpidrControl(SpidrControl),
    Tpx3Control(Tpx3ControlCmd),
    ExtraTimestamp(ExtraTimestamp),
}

impl DecodedPacket {
    /// Decodes a raw word into a typed packet.
    ///
    /// `chip_index` is the chip of the enclosing chunk and is only consumed
    /// by pixel words. Control words with unrecognized commands decode as
    /// [`Error::UnknownPacket`].
    pub fn decode(word: u64, chip_index: u8) -> Result<Self> {
        if ChunkHeader::is_header(word) {
            return Ok(DecodedPacket::ChunkHeader(ChunkHeader::new(word)));
        }
        let top_byte = (word >> 56) as u8;
        match PacketKind::of(word) {
            PacketKind::PixelCountFb | PacketKind::PixelStandard => {
                decode_pixel(word, chip_index).map(DecodedPacket::Hit)
            }
            PacketKind::Tdc => decode_tdc(word).map(DecodedPacket::Tdc),
            PacketKind::GlobalTimeLow | PacketKind::GlobalTimeHigh => decode_global_time(word)
                .map(DecodedPacket::GlobalTime)
                .ok_or(Error::UnknownPacket(top_byte)),
            PacketKind::SpidrId => decode_spidr_packet_id(word)
                .map(|packet_count| DecodedPacket::SpidrId { packet_count })
                .ok_or(Error::UnknownPacket(top_byte)),
            PacketKind::SpidrControl => decode_spidr_control(word)
                .map(DecodedPacket::SpidrControl)
                .ok_or(Error::UnknownPacket(top_byte)),
            PacketKind::Tpx3Control => decode_tpx3_control(word)
                .map(DecodedPacket::Tpx3Control)
                .ok_or(Error::UnknownPacket(top_byte)),
            PacketKind::ExtraTimestamp => {
                Ok(DecodedPacket::ExtraTimestamp(decode_extra_timestamp(word)))
            }
            PacketKind::Unknown => Err(Error::UnknownPacket(top_byte)),
        }
    }

    /// True if this is a pixel hit.
    pub fn is_hit(&self) -> bool {
        matches!(self, DecodedPacket::Hit(_))
    }

    /// The hit, if this is a pixel hit packet.
    pub fn as_hit(&self) -> Option<&PixelHit> {
        match self {
            DecodedPacket::Hit(hit) => Some(hit),
            _ => None,
        }
    }
}
