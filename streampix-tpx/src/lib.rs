//! streampix-tpx: TPX3/SPIDR wire format for the streaming pipeline.
//!
//! # Key Components
//!
//! - [`bitfield`] - bit range extraction and pixel address mapping
//! - [`packet`] - classification plus per-type decoders for all packet kinds
//! - [`framer`] - the stateful chunk framer driving a [`framer::PacketSink`]
//! - [`reorder`] - chunk-aware reordering of SPIDR packet ids
//! - [`parser`] - bulk decoding of captured files, parallel via rayon
//!
//! Words are 64-bit little-endian; bit numbering is MSB-63 .. LSB-0.

pub mod bitfield;
mod error;
pub mod framer;
pub mod packet;
pub mod parser;
pub mod reorder;

pub use bitfield::{bits, pixaddr_to_xy};
pub use error::{Error, Result};
pub use framer::{FramerConfig, PacketSink, ReorderConfig, StreamFramer};
pub use packet::{ChunkHeader, DecodedPacket, PacketKind, TPX3_MAGIC};
pub use parser::{BatchParser, BatchParserConfig};
pub use reorder::PacketReorderBuffer;
