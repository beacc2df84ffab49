//! streampix: real-time decoder for TPX3/SPIDR raw data streams.

use clap::{Args, Parser, Subcommand};
use log::error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use streampix_core::event::PixelHit;
use streampix_core::stats::Statistics;
use streampix_io::pipeline::{run_file, PipelineConfig, StatsEvent, StatsReporter, StreamPipeline};
use streampix_io::{RingBuffer, TcpClientConfig, TcpStreamClient};
use streampix_tpx::packet::DecodedPacket;
use streampix_tpx::{BatchParser, BatchParserConfig};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Ingest(#[from] streampix_io::Error),
}

/// Real-time TPX3/SPIDR stream decoder.
#[derive(Parser)]
#[command(name = "streampix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Pipeline options shared by the stream and file commands. Unset options
/// take their documented defaults (or the config file's values).
#[derive(Args, Debug, Clone)]
struct PipelineArgs {
    /// JSON configuration file ({"pipeline": {...}}); flags given here win
    /// over file values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable SPIDR packet id reordering
    #[arg(long)]
    reorder: bool,

    /// Reordering window in packets [default: 1000]
    #[arg(long)]
    reorder_window: Option<usize>,

    /// Ingest queue depth in buffers [default: 2000]
    #[arg(long)]
    queue_size: Option<usize>,

    /// Decoder worker threads; 0 decodes on the framer thread
    /// [default: auto]
    #[arg(long)]
    workers: Option<usize>,

    /// Recent hits retained for display; 0 disables [default: 10]
    #[arg(long)]
    recent_hits: Option<usize>,

    /// Words between periodic statistics reports; 0 disables
    /// [default: 1000]
    #[arg(long)]
    stats_packets: Option<u64>,

    /// Seconds between status heartbeats; 0 disables [default: 10]
    #[arg(long)]
    stats_seconds: Option<u64>,

    /// Only print the final statistics report
    #[arg(long)]
    final_only: bool,

    /// Disable statistics reporting entirely
    #[arg(long)]
    no_stats: bool,
}

impl PipelineArgs {
    fn build(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::default();
        if let Some(path) = &self.config {
            config = config.apply_json_file(path).map_err(CliError::Ingest)?;
        }
        if self.reorder {
            config.reorder_enabled = true;
        }
        if let Some(window) = self.reorder_window {
            config.reorder_window = window;
        }
        if let Some(capacity) = self.queue_size {
            config.queue_capacity = capacity;
        }
        if let Some(workers) = self.workers {
            config.decoder_workers = Some(workers);
        }
        if let Some(capacity) = self.recent_hits {
            config.recent_hit_capacity = capacity;
        }
        if let Some(interval) = self.stats_packets {
            config.stats_interval_packets = interval;
        }
        if let Some(seconds) = self.stats_seconds {
            config.stats_time_seconds = seconds;
        }
        if self.final_only {
            config.stats_final_only = true;
        }
        if self.no_stats {
            config.stats_disable = true;
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a live stream from the SPIDR readout
    Stream {
        /// Readout host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Readout port
        #[arg(long, default_value_t = 8085)]
        port: u16,

        /// Exit when the peer disconnects instead of reconnecting
        #[arg(long)]
        exit_on_disconnect: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Decode a raw capture file
    File {
        /// Input file of little-endian 64-bit stream words
        input: PathBuf,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Print a packet-type breakdown of a capture file
    Info {
        /// Input file
        input: PathBuf,

        /// Decode sequentially instead of in parallel
        #[arg(long)]
        sequential: bool,
    },

    /// Capture a raw stream to a file through the byte ring
    Capture {
        /// Readout host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Readout port
        #[arg(long, default_value_t = 8085)]
        port: u16,

        /// Output capture file
        #[arg(short, long)]
        output: PathBuf,

        /// Ring buffer size in bytes (rounded up to a power of two)
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        ring_size: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Stream {
            host,
            port,
            exit_on_disconnect,
            pipeline,
        } => run_stream(host, port, exit_on_disconnect, &pipeline),

        Commands::File { input, pipeline } => run_file_mode(&input, &pipeline),

        Commands::Info { input, sequential } => run_info(&input, sequential),

        Commands::Capture {
            host,
            port,
            output,
            ring_size,
        } => run_capture(host, port, &output, ring_size),
    }
}

/// Spawns a thread that flips `stop` on SIGINT/SIGTERM. Never touches the
/// aggregator.
fn spawn_signal_handler(stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let mut signals = match signal_hook::iterator::Signals::new([
            signal_hook::consts::SIGINT,
            signal_hook::consts::SIGTERM,
        ]) {
            Ok(signals) => signals,
            Err(e) => {
                error!("failed to register signal handler: {e}");
                return;
            }
        };
        if signals.forever().next().is_some() {
            eprintln!("\nStopping...");
            stop.store(true, Ordering::Relaxed);
        }
    });
}

fn make_reporter() -> StatsReporter {
    Box::new(|processor, event| match event {
        StatsEvent::Periodic => {
            println!("\n[Periodic Statistics Update]");
            print_statistics(&processor.get_statistics());
        }
        StatsEvent::Status {
            hits_delta,
            seconds,
        } => {
            println!("[Status] Processed {hits_delta} hits in last {seconds}s");
        }
    })
}

fn run_stream(host: String, port: u16, exit_on_disconnect: bool, args: &PipelineArgs) -> Result<()> {
    let mut config = args.build()?;
    config.exit_on_disconnect |= exit_on_disconnect;

    println!("TPX3 Raw Data Parser");
    println!("Connecting to {host}:{port}");

    let reporter = (!config.stats_disable && !config.stats_final_only).then(make_reporter);
    let net = TcpClientConfig {
        host,
        port,
        exit_on_disconnect: config.exit_on_disconnect,
    };
    let stats_disabled = config.stats_disable;
    let pipeline = StreamPipeline::start(config, net, reporter)?;

    let stop = pipeline.stop_handle();
    spawn_signal_handler(stop.clone());

    while !stop.load(Ordering::Relaxed) && !pipeline.is_finished() {
        std::thread::sleep(Duration::from_millis(100));
    }

    let processor = pipeline.shutdown();
    if !stats_disabled {
        print_statistics(&processor.get_statistics());
        print_recent_hits(&processor.get_recent_hits());
    }
    Ok(())
}

fn run_file_mode(input: &PathBuf, args: &PipelineArgs) -> Result<()> {
    let config = args.build()?;
    let stats_disabled = config.stats_disable;

    let reporter = (!config.stats_disable && !config.stats_final_only).then(make_reporter);
    let processor = run_file(input, &config, reporter)?;

    if !stats_disabled {
        print_statistics(&processor.get_statistics());
        print_recent_hits(&processor.get_recent_hits());
    }
    Ok(())
}

fn run_info(input: &PathBuf, sequential: bool) -> Result<()> {
    let reader = streampix_io::RawFileReader::open(input)?;
    let parser = BatchParser::with_config(BatchParserConfig::new().with_parallel(!sequential));
    let packets = parser.parse_bytes(reader.as_bytes());

    let mut headers = 0u64;
    let mut hits = 0u64;
    let mut tdc = 0u64;
    let mut global_time = 0u64;
    let mut spidr_ids = 0u64;
    let mut control = 0u64;
    let mut extra_ts = 0u64;
    let mut errors = 0u64;
    for packet in &packets {
        match packet {
            Ok(DecodedPacket::ChunkHeader(_)) => headers += 1,
            Ok(DecodedPacket::Hit(_)) => hits += 1,
            Ok(DecodedPacket::Tdc(_)) => tdc += 1,
            Ok(DecodedPacket::GlobalTime(_)) => global_time += 1,
            Ok(DecodedPacket::SpidrId { .. }) => spidr_ids += 1,
            Ok(DecodedPacket::SpidrControl(_)) | Ok(DecodedPacket::Tpx3Control(_)) => control += 1,
            Ok(DecodedPacket::ExtraTimestamp(_)) => extra_ts += 1,
            Err(_) => errors += 1,
        }
    }

    println!("File: {}", input.display());
    println!("Size: {} bytes ({} words)", reader.len(), reader.word_count());
    println!("Chunk headers:    {headers}");
    println!("Pixel hits:       {hits}");
    println!("TDC events:       {tdc}");
    println!("Global time:      {global_time}");
    println!("SPIDR packet IDs: {spidr_ids}");
    println!("Control packets:  {control}");
    println!("Extra timestamps: {extra_ts}");
    println!("Decode errors:    {errors}");
    Ok(())
}

fn run_capture(host: String, port: u16, output: &PathBuf, ring_size: usize) -> Result<()> {
    use std::io::Write;

    let stop = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(stop.clone());

    let client = TcpStreamClient::new(
        TcpClientConfig {
            host: host.clone(),
            port,
            exit_on_disconnect: true,
        },
        stop.clone(),
    )
    .map_err(CliError::Ingest)?;

    let file = std::fs::File::create(output)?;
    let ring = Arc::new(RingBuffer::new(ring_size));
    let dropped = Arc::new(AtomicU64::new(0));

    println!("Capturing {host}:{port} -> {}", output.display());

    let writer_ring = ring.clone();
    let writer_stop = stop.clone();
    let writer = std::thread::spawn(move || -> std::io::Result<u64> {
        let mut out = std::io::BufWriter::new(file);
        let mut buf = [0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = writer_ring.read(&mut buf);
            if n > 0 {
                out.write_all(&buf[..n])?;
                written += n as u64;
            } else if writer_stop.load(Ordering::Relaxed) && writer_ring.is_empty() {
                break;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        out.flush()?;
        Ok(written)
    });

    let capture_ring = ring.clone();
    let capture_dropped = dropped.clone();
    client.run(move |data| {
        // All-or-nothing so the capture stays word-aligned.
        if capture_ring.free() >= data.len() {
            capture_ring.write(data);
        } else {
            capture_dropped.fetch_add(1, Ordering::Relaxed);
        }
    });
    stop.store(true, Ordering::Relaxed);

    let written = match writer.join() {
        Ok(result) => result?,
        Err(_) => {
            error!("writer thread panicked");
            0
        }
    };
    println!("Captured {written} bytes");
    let dropped_buffers = dropped.load(Ordering::Relaxed);
    if dropped_buffers > 0 {
        println!("Dropped {dropped_buffers} buffers (ring full)");
    }
    Ok(())
}

fn print_statistics(stats: &Statistics) {
    println!("\n=== Statistics ===");
    println!("Total hits: {}", stats.total_hits);
    println!("Total chunks: {}", stats.total_chunks);
    println!(
        "Total TDC events: {} (TDC1: {}, TDC2: {})",
        stats.total_tdc_events, stats.total_tdc1_events, stats.total_tdc2_events
    );
    println!("Total control packets: {}", stats.total_control_packets);
    println!("Total decode errors: {}", stats.total_decode_errors);
    println!(
        "Total fractional errors: {}",
        stats.total_fractional_errors
    );
    println!("Total unknown packets: {}", stats.total_unknown_packets);
    println!(
        "Hit rate: {:.2} Hz (cumulative: {:.2} Hz)",
        stats.hit_rate_hz, stats.cumulative_hit_rate_hz
    );
    println!(
        "TDC1 rate: {:.2} Hz (cumulative: {:.2} Hz)",
        stats.tdc1_rate_hz, stats.cumulative_tdc1_rate_hz
    );

    if stats.packet_type_counts.iter().any(|&count| count > 0) {
        println!("Packet type breakdown:");
        for (packet_type, &count) in stats.packet_type_counts.iter().enumerate() {
            if count > 0 {
                println!("  Type {packet_type:#x} (0b{packet_type:04b}): {count}");
            }
        }
    }

    if stats.chip_valid.iter().any(|&valid| valid) {
        println!("Per-chip hits:");
        for (chip, &valid) in stats.chip_valid.iter().enumerate() {
            if valid {
                println!(
                    "  Chip {chip}: {} hits ({:.2} Hz), {} TDC1 ({:.2} Hz)",
                    stats.chip_hits[chip],
                    stats.chip_hit_rates_hz[chip],
                    stats.chip_tdc1_events[chip],
                    stats.chip_tdc1_rates_hz[chip]
                );
            }
        }
    }

    if !stats.packet_bytes.is_empty() {
        println!("Byte accounting:");
        for (category, bytes) in &stats.packet_bytes {
            println!("  {category}: {bytes} bytes");
        }
        println!("  Total accounted: {} bytes", stats.total_bytes_accounted);
    }

    if stats.reorder.total_packets > 0 {
        println!("Reorder buffer:");
        println!("  Immediate: {}", stats.reorder.packets_processed_immediately);
        println!("  Reordered: {}", stats.reorder.packets_reordered);
        println!("  Max distance: {}", stats.reorder.max_reorder_distance);
        println!("  Overflows: {}", stats.reorder.buffer_overflows);
        println!(
            "  Dropped too old: {}",
            stats.reorder.packets_dropped_too_old
        );
    }

    if stats.dropped_buffers > 0 {
        println!("Dropped input buffers: {}", stats.dropped_buffers);
    }
    if stats.bytes_dropped_incomplete > 0 {
        println!(
            "Bytes dropped (incomplete words): {}",
            stats.bytes_dropped_incomplete
        );
    }
    if stats.started_mid_stream {
        println!("Note: stream started mid-chunk");
    }
}

fn print_recent_hits(hits: &[PixelHit]) {
    if hits.is_empty() {
        return;
    }
    println!("\n=== Recent Hits (last {}) ===", hits.len());
    for hit in hits {
        println!(
            "Chip {}, X={}, Y={}, ToA={} (1.5625ns units), ToT={} ns [{}]",
            hit.chip_index,
            hit.x,
            hit.y,
            hit.toa_ticks,
            hit.tot_ns,
            if hit.is_count_fb { "count_fb" } else { "standard" }
        );
    }
}
