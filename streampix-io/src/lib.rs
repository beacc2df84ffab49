//! streampix-io: ingest and pipeline wiring for live TPX3 decoding.
//!
//! - [`queue`] - bounded drop-oldest buffer queue (network to framer)
//! - [`ring`] - lock-free SPSC byte ring for the capture path
//! - [`net`] - reconnecting TCP client with word-alignment carry
//! - [`reader`] - memory-mapped file input
//! - [`dispatch`] - chip-keyed decode worker pool with partial-stats merge
//! - [`pipeline`] - wiring, lifecycle, and statistics cadence

pub mod dispatch;
mod error;
pub mod net;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod ring;

pub use dispatch::{default_stream_workers, DecodeDispatcher, DispatcherConfig, InlineDecoder};
pub use error::{Error, Result};
pub use net::{TcpClientConfig, TcpStreamClient};
pub use pipeline::{run_file, PipelineConfig, StatsEvent, StatsReporter, StreamPipeline};
pub use queue::BufferQueue;
pub use reader::RawFileReader;
pub use ring::RingBuffer;
