//! streampix-core: Data model and statistics aggregation for live TPX3 decoding.
//!
//! This crate holds everything the streaming pipeline shares that is not the
//! wire format itself:
//!
//! - [`event`] - typed records produced by the packet decoders
//! - [`timing`] - clock constants and 30-bit timestamp extension
//! - [`stats`] - the statistics snapshot and worker partial accumulators
//! - [`processor`] - the lock-protected [`HitProcessor`] aggregate
//!
//! The bit-level decoders live in `streampix-tpx`; ingest and threading live
//! in `streampix-io`.

pub mod event;
pub mod processor;
pub mod stats;
pub mod timing;

pub use event::{
    ChunkMetadata, ExtraTimestamp, GlobalTime, PixelHit, SpidrControl, SpidrControlCmd, TdcEvent,
    TdcEventKind, Tpx3ControlCmd,
};
pub use processor::HitProcessor;
pub use stats::{PartialStats, RecentHitRing, ReorderStats, Statistics, MAX_CHIPS};
pub use timing::{extend_timestamp, TOA_TICK_SECONDS};
