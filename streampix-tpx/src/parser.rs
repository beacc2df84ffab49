//! Batch decoding of captured raw data.
//!
//! The live pipeline decodes through the stream framer; this parser is for
//! offline work on captured files, where chunk context reduces to tracking
//! the chip index per header and everything can be decoded in bulk.

use crate::packet::{ChunkHeader, DecodedPacket};
use crate::Result;
use rayon::prelude::*;

/// Configuration for the batch parser.
#[derive(Debug, Clone)]
pub struct BatchParserConfig {
    /// Keep only pixel hit packets.
    pub hits_only: bool,
    /// Decode word-parallel with rayon above `chunk_size` words.
    pub parallel: bool,
    /// Word count threshold for going parallel.
    pub chunk_size: usize,
}

impl Default for BatchParserConfig {
    fn default() -> Self {
        Self {
            hits_only: false,
            parallel: true,
            chunk_size: 1024 * 1024,
        }
    }
}

impl BatchParserConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits_only(mut self, hits_only: bool) -> Self {
        self.hits_only = hits_only;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }
}

/// Decodes raw captures into typed packets.
#[derive(Debug, Clone, Default)]
pub struct BatchParser {
    config: BatchParserConfig,
}

impl BatchParser {
    pub fn new() -> Self {
        Self {
            config: BatchParserConfig::default(),
        }
    }

    pub fn with_config(config: BatchParserConfig) -> Self {
        Self { config }
    }

    /// Decodes a little-endian byte capture. Trailing bytes that do not
    /// form a whole word are ignored.
    pub fn parse_bytes(&self, data: &[u8]) -> Vec<Result<DecodedPacket>> {
        let words: Vec<u64> = data
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        self.parse_words(&words)
    }

    /// Decodes raw 64-bit words.
    ///
    /// Chip context comes from chunk headers encountered in order; the
    /// sequential pre-pass that assigns a chip to each word is cheap
    /// compared to decoding, which parallelizes when the input is large.
    pub fn parse_words(&self, words: &[u64]) -> Vec<Result<DecodedPacket>> {
        let chips = assign_chip_indices(words);

        if self.config.parallel && words.len() > self.config.chunk_size {
            let decoded: Vec<Result<DecodedPacket>> = words
                .par_iter()
                .zip(chips.par_iter())
                .map(|(&word, &chip)| DecodedPacket::decode(word, chip))
                .collect();
            self.filter(decoded)
        } else {
            let decoded = words
                .iter()
                .zip(chips.iter())
                .map(|(&word, &chip)| DecodedPacket::decode(word, chip))
                .collect();
            self.filter(decoded)
        }
    }

    fn filter(&self, decoded: Vec<Result<DecodedPacket>>) -> Vec<Result<DecodedPacket>> {
        if !self.config.hits_only {
            return decoded;
        }
        decoded
            .into_iter()
            .filter(|packet| matches!(packet, Ok(p) if p.is_hit()))
            .collect()
    }
}

/// Sequential pre-pass: the chip index in effect for each word, taken from
/// the most recent chunk header (0 before the first header).
fn assign_chip_indices(words: &[u64]) -> Vec<u8> {
    let mut chips = Vec::with_capacity(words.len());
    let mut chip = 0u8;
    for &word in words {
        if ChunkHeader::is_header(word) {
            chip = ChunkHeader::new(word).chip_index();
        }
        chips.push(chip);
    }
    chips
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TPX3_MAGIC;

    fn make_header(chip: u8, size_bytes: u16) -> u64 {
        (u64::from(size_bytes) << 48) | (u64::from(chip) << 32) | TPX3_MAGIC
    }

    fn make_pixel(spidr: u64) -> u64 {
        0xB << 60 | 100 << 30 | 5 << 20 | spidr
    }

    #[test]
    fn test_parse_bytes_roundtrip() {
        let mut data = Vec::new();
        data.extend_from_slice(&make_header(2, 24).to_le_bytes());
        data.extend_from_slice(&make_pixel(1).to_le_bytes());
        data.extend_from_slice(&make_pixel(2).to_le_bytes());

        let parser = BatchParser::new();
        let packets = parser.parse_bytes(&data);
        assert_eq!(packets.len(), 3);
        assert!(matches!(packets[0], Ok(DecodedPacket::ChunkHeader(_))));
        let hit = packets[1].as_ref().unwrap().as_hit().unwrap();
        assert_eq!(hit.chip_index, 2);
    }

    #[test]
    fn test_chip_tracking_across_headers() {
        let words = vec![
            make_header(1, 16),
            make_pixel(1),
            make_header(3, 16),
            make_pixel(2),
        ];
        let parser = BatchParser::new();
        let packets = parser.parse_words(&words);
        assert_eq!(packets[1].as_ref().unwrap().as_hit().unwrap().chip_index, 1);
        assert_eq!(packets[3].as_ref().unwrap().as_hit().unwrap().chip_index, 3);
    }

    #[test]
    fn test_hits_only_filter() {
        let words = vec![make_header(0, 24), make_pixel(1), 0x30u64 << 56];
        let parser = BatchParser::with_config(BatchParserConfig::new().with_hits_only(true));
        let packets = parser.parse_words(&words);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].as_ref().unwrap().is_hit());
    }

    #[test]
    fn test_ignores_trailing_partial_word() {
        let mut data = make_pixel(0).to_le_bytes().to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        let parser = BatchParser::new();
        assert_eq!(parser.parse_bytes(&data).len(), 1);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let words: Vec<u64> = (0..512).map(make_pixel).collect();
        let sequential = BatchParser::with_config(
            BatchParserConfig::new().with_parallel(false),
        )
        .parse_words(&words);
        let parallel = BatchParser::with_config(
            BatchParserConfig::new().with_parallel(true).with_chunk_size(64),
        )
        .parse_words(&words);
        assert_eq!(sequential.len(), parallel.len());
        for (a, b) in sequential.iter().zip(parallel.iter()) {
            assert_eq!(a.is_ok(), b.is_ok());
        }
    }
}
