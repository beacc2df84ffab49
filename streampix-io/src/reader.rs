//! Memory-mapped file input.
#![allow(unsafe_code)]

use crate::Result;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Slice size used when feeding a mapped file through the framer.
pub const FILE_SLICE_BYTES: usize = 8 * 1024 * 1024;

/// A raw capture file, memory-mapped.
pub struct RawFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl RawFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: the file is opened read-only and assumed not to be
        // modified concurrently, the standard contract for mapping.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Number of whole 64-bit words in the file.
    pub fn word_count(&self) -> usize {
        self.mmap.len() / 8
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Word-aligned slices of at most [`FILE_SLICE_BYTES`]; the final slice
    /// carries any trailing partial word.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        let aligned = self.len() - self.len() % 8;
        let data = self.as_bytes();
        let mut offset = 0;
        std::iter::from_fn(move || {
            if offset >= data.len() {
                return None;
            }
            let end = if offset + FILE_SLICE_BYTES >= aligned {
                data.len()
            } else {
                offset + FILE_SLICE_BYTES
            };
            let slice = &data[offset..end];
            offset = end;
            Some(slice)
        })
    }
}
