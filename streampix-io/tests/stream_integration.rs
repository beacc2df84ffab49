//! End-to-end decoding tests over synthetic SPIDR streams.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use streampix_core::processor::HitProcessor;
use streampix_io::pipeline::{run_file, PipelineConfig};
use streampix_io::InlineDecoder;
use streampix_tpx::framer::{FramerConfig, ReorderConfig, StreamFramer};
use streampix_tpx::packet::TPX3_MAGIC;

fn make_header(chip: u8, size_words: u16) -> u64 {
    (u64::from(size_words * 8) << 48) | (u64::from(chip) << 32) | TPX3_MAGIC
}

fn make_pixel(spidr: u64, toa: u64) -> u64 {
    0xB << 60 | (42 << 9) << 44 | toa << 30 | 8 << 20 | spidr
}

fn make_tdc(subtype: u64, coarse: u64) -> u64 {
    0x6 << 60 | subtype << 56 | coarse << 9 | 1 << 5
}

fn make_extra_ts(ticks: u64) -> u64 {
    0x51 << 56 | ticks
}

fn make_spidr_id(id: u64) -> u64 {
    0x50 << 56 | id
}

fn write_capture(name: &str, words: &[u64]) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("streampix-it-{}-{name}.tpx3", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    for word in words {
        file.write_all(&word.to_le_bytes()).unwrap();
    }
    path
}

/// A stream of chunks across all four chips with pixels, both TDC inputs,
/// control words, and an unknown word mixed in.
fn mixed_stream() -> (Vec<u64>, u64, u64, u64) {
    let mut words = Vec::new();
    let mut expected_hits = 0u64;
    let mut expected_tdc1 = 0u64;
    let mut expected_tdc2 = 0u64;

    for round in 0..10u64 {
        for chip in 0..4u8 {
            // 8 payload words; size is inclusive of the header.
            words.push(make_header(chip, 9));
            words.push(make_tdc(0xF, 1_000 * (round + 1)));
            expected_tdc1 += 1;
            for i in 0..5 {
                words.push(make_pixel(round + 1, 100 * u64::from(chip) + i));
                expected_hits += 1;
            }
            words.push(make_tdc(0xB, 1_000 * (round + 1) + 7));
            expected_tdc2 += 1;
            words.push(0x71u64 << 56 | 0xB0u64 << 48);
        }
    }
    // One unknown word ahead of everything (mid-stream noise).
    words.insert(0, 0x33u64 << 56);
    (words, expected_hits, expected_tdc1, expected_tdc2)
}

#[test]
fn decodes_mixed_stream_and_holds_invariants() {
    let (words, expected_hits, expected_tdc1, expected_tdc2) = mixed_stream();
    let path = write_capture("mixed", &words);

    let config = PipelineConfig {
        decoder_workers: Some(3),
        ..Default::default()
    };
    let processor = run_file(&path, &config, None).unwrap();
    let stats = processor.get_statistics();

    assert_eq!(stats.total_hits, expected_hits);
    assert_eq!(stats.total_tdc1_events, expected_tdc1);
    assert_eq!(stats.total_tdc2_events, expected_tdc2);
    assert_eq!(
        stats.total_tdc_events,
        stats.total_tdc1_events + stats.total_tdc2_events
    );
    let per_chip: u64 = stats.chip_hits.iter().sum();
    assert_eq!(per_chip, stats.total_hits);
    assert_eq!(stats.total_chunks, 40);
    assert_eq!(stats.total_control_packets, 40);
    assert_eq!(stats.total_unknown_packets, 0); // noise word was pre-header
    assert!(stats.started_mid_stream);

    if stats.hit_ticks_initialized {
        assert!(stats.earliest_hit_ticks <= stats.latest_hit_ticks);
    }
    if stats.tdc1_ticks_initialized {
        assert!(stats.earliest_tdc1_ticks <= stats.latest_tdc1_ticks);
    }

    // Every word the framer saw is accounted to exactly one category.
    assert_eq!(stats.total_bytes_accounted, 8 * words.len() as u64);
    let by_category: u64 = stats.packet_bytes.values().sum();
    assert_eq!(by_category, stats.total_bytes_accounted);

    // Rates are non-negative and cumulative matches total/span.
    assert!(stats.cumulative_hit_rate_hz >= 0.0);
    if let Some(span) = stats.hit_span_seconds() {
        if span > 0.0 {
            let expected = stats.total_hits as f64 / span;
            assert!((stats.cumulative_hit_rate_hz - expected).abs() / expected < 1e-9);
        }
    }

    std::fs::remove_file(path).ok();
}

#[test]
fn reorder_counters_partition_total() {
    let processor = Arc::new(HitProcessor::new(0));
    let decoder = InlineDecoder::new(processor.clone(), 0);
    let config = FramerConfig {
        reorder: Some(ReorderConfig {
            window: 4,
            chunk_aware: true,
        }),
        ..Default::default()
    };
    let mut framer = StreamFramer::new(processor.clone(), &decoder, config);

    // One chunk whose payload is SPIDR ids arriving shuffled, with a gap
    // that forces bypass and a stale id that gets dropped.
    let ids = [0u64, 1, 3, 2, 5, 9, 10, 11, 12, 13, 1];
    let mut words = vec![make_header(0, (ids.len() + 1) as u16)];
    words.extend(ids.iter().map(|&id| make_spidr_id(id)));
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    framer.process_buffer(&bytes);
    framer.finish();
    decoder.flush();

    let reorder = processor.get_statistics().reorder;
    assert_eq!(reorder.total_packets, ids.len() as u64);
    assert_eq!(
        reorder.packets_processed_immediately
            + reorder.packets_reordered
            + reorder.packets_dropped_too_old
            + reorder.buffer_overflows,
        reorder.total_packets
    );
}

#[test]
fn trailer_metadata_extends_following_pixel() {
    // The chunk size includes the header word, so a producer can place one
    // payload word after the trailer; that word sees valid metadata.
    let minimum = 0x9_0000_0000u64;
    let words = vec![
        make_header(2, 4),
        make_extra_ts(minimum - 10), // generation time
        make_extra_ts(minimum),      // min
        make_extra_ts(minimum + 500), // max
        make_pixel(0, 0x30),
    ];
    let path = write_capture("trailer", &words);

    let processor = run_file(&path, &PipelineConfig::default(), None).unwrap();
    let hits = processor.get_recent_hits();
    assert_eq!(hits.len(), 1);
    let toa = hits[0].toa_ticks;
    assert!(toa >= minimum);
    assert!(toa < minimum + (1 << 30));
    assert_eq!(hits[0].chip_index, 2);

    std::fs::remove_file(path).ok();
}

#[test]
fn file_tail_partial_word_is_dropped() {
    let words = vec![make_header(0, 2), make_pixel(0, 1)];
    let mut path = std::env::temp_dir();
    path.push(format!("streampix-it-{}-tail.tpx3", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    for word in &words {
        file.write_all(&word.to_le_bytes()).unwrap();
    }
    file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
    drop(file);

    let processor = run_file(&path, &PipelineConfig::default(), None).unwrap();
    let stats = processor.get_statistics();
    assert_eq!(stats.bytes_dropped_incomplete, 3);
    assert_eq!(stats.total_hits, 1);

    std::fs::remove_file(path).ok();
}
