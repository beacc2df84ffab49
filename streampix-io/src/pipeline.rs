//! Pipeline wiring: queue, framer thread, decode workers, aggregator.
//!
//! Stream mode runs three kinds of threads: the network producer pushing
//! into the [`BufferQueue`], one framer consumer draining it, and the
//! decode worker pool. File mode drives the framer inline over a
//! memory-mapped input.

use crate::dispatch::{default_stream_workers, DecodeDispatcher, DispatcherConfig, InlineDecoder};
use crate::net::{TcpClientConfig, TcpStreamClient};
use crate::queue::BufferQueue;
use crate::reader::RawFileReader;
use crate::{Error, Result};
use log::debug;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use streampix_core::event::ChunkMetadata;
use streampix_core::processor::HitProcessor;
use streampix_tpx::framer::{FramerConfig, PacketSink, ReorderConfig, StreamFramer};

/// Framer-side queue poll interval; bounds stop-signal latency.
const QUEUE_POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Pipeline settings with the documented defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Enable SPIDR packet id reordering.
    pub reorder_enabled: bool,
    /// Reordering window (max buffered packets).
    pub reorder_window: usize,
    /// Ingest queue depth.
    pub queue_capacity: usize,
    /// Decode worker count; `None` selects per mode (stream: max(4, cores);
    /// file: 1). 0 decodes inline on the framer thread.
    pub decoder_workers: Option<usize>,
    /// Recent-hit ring capacity (0 disables).
    pub recent_hit_capacity: usize,
    /// Words between periodic statistics reports (0 disables).
    pub stats_interval_packets: u64,
    /// Seconds between status heartbeats (0 disables).
    pub stats_time_seconds: u64,
    /// Suppress periodic reports, keep the final one.
    pub stats_final_only: bool,
    /// Suppress all statistics reporting.
    pub stats_disable: bool,
    /// Stop instead of reconnecting when the peer closes.
    pub exit_on_disconnect: bool,
    /// Disable per-category byte accounting.
    pub skip_byte_accounting: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reorder_enabled: false,
            reorder_window: 1000,
            queue_capacity: BufferQueue::DEFAULT_CAPACITY,
            decoder_workers: None,
            recent_hit_capacity: 10,
            stats_interval_packets: 1000,
            stats_time_seconds: 10,
            stats_final_only: false,
            stats_disable: false,
            exit_on_disconnect: false,
            skip_byte_accounting: false,
        }
    }
}

// Intermediate struct for the JSON config schema; every field optional so
// partial documents override only what they name.
#[derive(Deserialize)]
struct JsonConfig {
    pipeline: JsonPipeline,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonPipeline {
    reorder_enabled: Option<bool>,
    reorder_window: Option<usize>,
    queue_capacity: Option<usize>,
    decoder_workers: Option<usize>,
    recent_hit_capacity: Option<usize>,
    stats_interval_packets: Option<u64>,
    stats_time_seconds: Option<u64>,
    stats_final_only: Option<bool>,
    stats_disable: Option<bool>,
    exit_on_disconnect: Option<bool>,
}

impl PipelineConfig {
    /// Overlays values from a `{"pipeline": {...}}` JSON document onto
    /// `self`. Missing fields keep their current values.
    pub fn apply_json(mut self, json: &str) -> Result<Self> {
        let parsed: JsonConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        let p = parsed.pipeline;
        if let Some(v) = p.reorder_enabled {
            self.reorder_enabled = v;
        }
        if let Some(v) = p.reorder_window {
            self.reorder_window = v;
        }
        if let Some(v) = p.queue_capacity {
            self.queue_capacity = v;
        }
        if let Some(v) = p.decoder_workers {
            self.decoder_workers = Some(v);
        }
        if let Some(v) = p.recent_hit_capacity {
            self.recent_hit_capacity = v;
        }
        if let Some(v) = p.stats_interval_packets {
            self.stats_interval_packets = v;
        }
        if let Some(v) = p.stats_time_seconds {
            self.stats_time_seconds = v;
        }
        if let Some(v) = p.stats_final_only {
            self.stats_final_only = v;
        }
        if let Some(v) = p.stats_disable {
            self.stats_disable = v;
        }
        if let Some(v) = p.exit_on_disconnect {
            self.exit_on_disconnect = v;
        }
        Ok(self)
    }

    /// Loads overrides from a JSON file.
    pub fn apply_json_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        self.apply_json(&contents)
    }

    fn framer_config(&self) -> FramerConfig {
        FramerConfig {
            reorder: self.reorder_enabled.then(|| ReorderConfig {
                window: self.reorder_window,
                chunk_aware: true,
            }),
            skip_byte_accounting: self.skip_byte_accounting,
        }
    }
}

/// What a periodic report callback is being invoked for.
#[derive(Debug, Clone, Copy)]
pub enum StatsEvent {
    /// Packet-cadence full statistics report.
    Periodic,
    /// Time-cadence heartbeat with the hit delta since the last one.
    Status { hits_delta: u64, seconds: u64 },
}

/// Callback invoked on the framer thread at reporting points. Snapshot the
/// aggregator inside; never block for long.
pub type StatsReporter = Box<dyn FnMut(&HitProcessor, StatsEvent) + Send>;

/// Decode backend: the worker pool, or inline decoding on the framer
/// thread when `decoder_workers` is 0.
pub enum DecodeBackend {
    Pool(DecodeDispatcher),
    Inline(InlineDecoder),
}

impl DecodeBackend {
    fn new(processor: Arc<HitProcessor>, workers: usize, recent_hit_capacity: usize) -> Self {
        if workers == 0 {
            DecodeBackend::Inline(InlineDecoder::new(processor, recent_hit_capacity))
        } else {
            DecodeBackend::Pool(DecodeDispatcher::new(
                processor,
                DispatcherConfig {
                    workers,
                    recent_hit_capacity,
                },
            ))
        }
    }

    /// Merges partial stats so a snapshot reflects all decoded words.
    fn flush(&self) {
        match self {
            DecodeBackend::Pool(pool) => {
                pool.wait_until_idle();
            }
            DecodeBackend::Inline(inline) => inline.flush(),
        }
    }

    /// Final drain and teardown.
    fn finish(&self) {
        match self {
            DecodeBackend::Pool(pool) => {
                pool.wait_until_idle();
                pool.stop();
            }
            DecodeBackend::Inline(inline) => inline.flush(),
        }
    }
}

impl PacketSink for DecodeBackend {
    fn submit_batch(&self, words: &[u64], chip_index: u8, meta: ChunkMetadata) {
        match self {
            DecodeBackend::Pool(pool) => pool.submit_batch(words, chip_index, meta),
            DecodeBackend::Inline(inline) => inline.submit_batch(words, chip_index, meta),
        }
    }
}

/// Tracks reporting cadence on the framer thread.
struct ReportCadence {
    interval_words: u64,
    interval_secs: u64,
    enabled: bool,
    words_since_report: u64,
    last_status: Instant,
    last_status_hits: u64,
}

impl ReportCadence {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            interval_words: config.stats_interval_packets,
            interval_secs: config.stats_time_seconds,
            enabled: !config.stats_disable && !config.stats_final_only,
            words_since_report: 0,
            last_status: Instant::now(),
            last_status_hits: 0,
        }
    }

    fn on_words(
        &mut self,
        words: u64,
        backend: &DecodeBackend,
        processor: &HitProcessor,
        reporter: &mut Option<StatsReporter>,
    ) {
        if !self.enabled || reporter.is_none() {
            return;
        }
        self.words_since_report += words;

        if self.interval_words > 0 && self.words_since_report >= self.interval_words {
            self.words_since_report = 0;
            backend.flush();
            if let Some(report) = reporter.as_mut() {
                report(processor, StatsEvent::Periodic);
            }
        }

        if self.interval_secs > 0 && self.last_status.elapsed().as_secs() >= self.interval_secs {
            backend.flush();
            let total = processor.get_statistics().total_hits;
            if let Some(report) = reporter.as_mut() {
                report(
                    processor,
                    StatsEvent::Status {
                        hits_delta: total - self.last_status_hits,
                        seconds: self.interval_secs,
                    },
                );
            }
            self.last_status_hits = total;
            self.last_status = Instant::now();
        }
    }
}

/// A running stream-mode pipeline.
pub struct StreamPipeline {
    processor: Arc<HitProcessor>,
    queue: Arc<BufferQueue>,
    stop: Arc<AtomicBool>,
    framer_handle: Option<JoinHandle<()>>,
    network_handle: Option<JoinHandle<u64>>,
}

impl StreamPipeline {
    /// Validates the address, spawns the network producer and the framer
    /// consumer, and starts decoding.
    pub fn start(
        config: PipelineConfig,
        net: TcpClientConfig,
        reporter: Option<StatsReporter>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let client = TcpStreamClient::new(
            TcpClientConfig {
                exit_on_disconnect: config.exit_on_disconnect,
                ..net
            },
            stop.clone(),
        )?;

        let processor = Arc::new(HitProcessor::new(config.recent_hit_capacity));
        let queue = Arc::new(BufferQueue::new(config.queue_capacity));
        let workers = config.decoder_workers.unwrap_or_else(default_stream_workers);
        let backend = Arc::new(DecodeBackend::new(
            processor.clone(),
            workers,
            config.recent_hit_capacity,
        ));

        let framer_handle = {
            let processor = processor.clone();
            let queue = queue.clone();
            let backend = backend.clone();
            let framer_config = config.framer_config();
            let mut cadence = ReportCadence::new(&config);
            let mut reporter = reporter;
            std::thread::Builder::new()
                .name("framer".into())
                .spawn(move || {
                    let mut framer =
                        StreamFramer::new(processor.clone(), backend.clone(), framer_config);
                    loop {
                        match queue.pop(QUEUE_POP_TIMEOUT) {
                            Some(buffer) => {
                                framer.process_buffer(&buffer);
                                cadence.on_words(
                                    (buffer.len() / 8) as u64,
                                    &backend,
                                    &processor,
                                    &mut reporter,
                                );
                            }
                            None => {
                                if queue.is_finished() {
                                    break;
                                }
                            }
                        }
                    }
                    framer.finish();
                    backend.finish();
                    debug!("framer thread exiting");
                })?
        };

        let network_handle = {
            let queue = queue.clone();
            std::thread::Builder::new().name("network".into()).spawn(move || {
                let leftover = client.run(|data| queue.push(data));
                // Producer done (stop or disconnect): let the framer drain
                // out.
                queue.stop();
                leftover
            })?
        };

        Ok(Self {
            processor,
            queue,
            stop,
            framer_handle: Some(framer_handle),
            network_handle: Some(network_handle),
        })
    }

    pub fn processor(&self) -> Arc<HitProcessor> {
        self.processor.clone()
    }

    /// Flag observed by the network thread; setting it begins shutdown.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// True once the framer has drained and exited (e.g. after a
    /// disconnect with `exit_on_disconnect`).
    pub fn is_finished(&self) -> bool {
        self.framer_handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Stops the producer, drains everything in flight, finalizes rates,
    /// and joins all threads.
    pub fn shutdown(mut self) -> Arc<HitProcessor> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.network_handle.take() {
            if let Ok(leftover_bytes) = handle.join() {
                if leftover_bytes > 0 {
                    self.processor.add_bytes_dropped_incomplete(leftover_bytes);
                }
            }
        }
        // The network thread stopped the queue; the framer drains and then
        // tears down the decode backend itself.
        if let Some(handle) = self.framer_handle.take() {
            let _ = handle.join();
        }
        self.processor.set_dropped_buffers(self.queue.dropped_buffers());
        self.processor.finalize_rates();
        self.processor.clone()
    }
}

/// Runs the framer inline over a memory-mapped file and returns the
/// aggregator with final rates.
pub fn run_file(
    path: &Path,
    config: &PipelineConfig,
    reporter: Option<StatsReporter>,
) -> Result<Arc<HitProcessor>> {
    let reader = RawFileReader::open(path)?;
    let processor = Arc::new(HitProcessor::new(config.recent_hit_capacity));
    let workers = config.decoder_workers.unwrap_or(1);
    let backend = DecodeBackend::new(processor.clone(), workers, config.recent_hit_capacity);

    let mut framer = StreamFramer::new(processor.clone(), &backend, config.framer_config());
    let mut cadence = ReportCadence::new(config);
    let mut reporter = reporter;

    for slice in reader.slices() {
        framer.process_buffer(slice);
        cadence.on_words((slice.len() / 8) as u64, &backend, &processor, &mut reporter);
    }
    framer.finish();
    backend.finish();

    processor.finalize_rates();
    Ok(processor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use streampix_tpx::packet::TPX3_MAGIC;

    fn make_header(chip: u8, size_bytes: u16) -> u64 {
        (u64::from(size_bytes) << 48) | (u64::from(chip) << 32) | TPX3_MAGIC
    }

    fn make_pixel(spidr: u64, toa: u64) -> u64 {
        0xB << 60 | toa << 30 | 7 << 20 | spidr
    }

    fn make_tdc1(coarse: u64) -> u64 {
        0x6 << 60 | 0xF << 56 | coarse << 9 | 1 << 5
    }

    fn make_extra_ts(ticks: u64) -> u64 {
        0x51 << 56 | ticks
    }

    fn write_capture(name: &str, words: &[u64]) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "streampix-pipeline-{name}-{}.tpx3",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        for word in words {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        path
    }

    /// Synthetic two-chunk stream exercising pixels, TDC, and the trailer.
    fn synthetic_stream() -> Vec<u64> {
        let mut words = Vec::new();
        // Chunk on chip 0: 4 pixels + TDC + trailer, size inclusive of
        // header = 9 words.
        words.push(make_header(0, 9 * 8));
        words.push(make_tdc1(50));
        for i in 0..4 {
            words.push(make_pixel(1, 100 + i));
        }
        words.push(make_extra_ts(5000));
        words.push(make_extra_ts(1000));
        words.push(make_extra_ts(9000));
        // Chunk on chip 1: 2 pixels, no trailer (size 3 words).
        words.push(make_header(1, 3 * 8));
        words.push(make_pixel(2, 300));
        words.push(make_pixel(2, 301));
        words
    }

    #[test]
    fn test_run_file_decodes_stream() {
        let words = synthetic_stream();
        let path = write_capture("decodes", &words);

        let config = PipelineConfig {
            decoder_workers: Some(2),
            ..Default::default()
        };
        let processor = run_file(&path, &config, None).unwrap();
        let stats = processor.get_statistics();

        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_hits, 6);
        assert_eq!(stats.total_tdc_events, 1);
        assert_eq!(stats.total_tdc1_events, 1);
        assert_eq!(stats.chip_hits[0], 4);
        // Invariant: per-chip totals sum to the grand total.
        let per_chip: u64 = stats.chip_hits.iter().sum();
        assert_eq!(per_chip, stats.total_hits);
        assert!(!stats.started_mid_stream);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_run_file_inline_matches_pool() {
        let words = synthetic_stream();
        let path = write_capture("inline", &words);

        let pool = run_file(
            &path,
            &PipelineConfig {
                decoder_workers: Some(3),
                ..Default::default()
            },
            None,
        )
        .unwrap()
        .get_statistics();
        let inline = run_file(
            &path,
            &PipelineConfig {
                decoder_workers: Some(0),
                ..Default::default()
            },
            None,
        )
        .unwrap()
        .get_statistics();

        assert_eq!(pool.total_hits, inline.total_hits);
        assert_eq!(pool.total_tdc_events, inline.total_tdc_events);
        assert_eq!(pool.chip_hits, inline.chip_hits);
        assert_eq!(pool.total_bytes_accounted, inline.total_bytes_accounted);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_byte_accounting_totals_whole_file() {
        let words = synthetic_stream();
        let path = write_capture("bytes", &words);

        let processor = run_file(&path, &PipelineConfig::default(), None).unwrap();
        let stats = processor.get_statistics();
        // Every framer-processed word lands in exactly one category.
        assert_eq!(stats.total_bytes_accounted, 8 * words.len() as u64);
        let by_category: u64 = stats.packet_bytes.values().sum();
        assert_eq!(by_category, stats.total_bytes_accounted);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_stream_pipeline_end_to_end() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let words = synthetic_stream();
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(&payload).unwrap();
        });

        let config = PipelineConfig {
            exit_on_disconnect: true,
            decoder_workers: Some(2),
            ..Default::default()
        };
        let pipeline = StreamPipeline::start(
            config,
            TcpClientConfig {
                host: "127.0.0.1".to_owned(),
                port,
                exit_on_disconnect: true,
            },
            None,
        )
        .unwrap();
        server.join().unwrap();

        // Disconnect with exit_on_disconnect drains the pipeline.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pipeline.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let processor = pipeline.shutdown();
        let stats = processor.get_statistics();
        assert_eq!(stats.total_hits, 6);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.dropped_buffers, 0);
    }

    #[test]
    fn test_config_json_partial_override() {
        let json = r#"{
            "pipeline": {
                "reorder_enabled": true,
                "reorder_window": 64,
                "stats_time_seconds": 0
            }
        }"#;
        let config = PipelineConfig::default().apply_json(json).unwrap();
        assert!(config.reorder_enabled);
        assert_eq!(config.reorder_window, 64);
        assert_eq!(config.stats_time_seconds, 0);
        // Untouched fields keep their defaults.
        assert_eq!(config.queue_capacity, 2000);
        assert_eq!(config.recent_hit_capacity, 10);
    }

    #[test]
    fn test_config_json_invalid_rejected() {
        assert!(PipelineConfig::default().apply_json("not json").is_err());
        assert!(PipelineConfig::default().apply_json("{}").is_err());
    }
}
