use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use super::error::RawFileError;

/// A recorded raw word stream, a flat file of little-endian u32 bus words.
///
/// Reads are chunked so a recorded run can be replayed through the same
/// pipeline that consumes live FIFO data.
#[derive(Debug)]
pub struct RawFile {
    handle: BufReader<File>,
    path: PathBuf,
    size_bytes: u64,
    words_remaining: u64,
}

impl RawFile {
    pub fn new(path: &Path) -> Result<Self, RawFileError> {
        if !path.exists() {
            return Err(RawFileError::BadFilePath(path.to_path_buf()));
        }
        let size_bytes = path.metadata()?.len();
        let file = File::open(path)?;
        Ok(Self {
            handle: BufReader::new(file),
            path: path.to_path_buf(),
            size_bytes,
            // A trailing partial word cannot be decoded and is dropped
            words_remaining: size_bytes / 4,
        })
    }

    /// Read the next chunk of at most `max_words` words.
    ///
    /// Returns `RawFileError::EndOfFile` once the stream is exhausted.
    pub fn read_chunk(&mut self, max_words: usize) -> Result<Vec<u32>, RawFileError> {
        if self.words_remaining == 0 {
            return Err(RawFileError::EndOfFile);
        }
        let n = (max_words as u64).min(self.words_remaining) as usize;
        let mut words = vec![0u32; n];
        self.handle.read_u32_into::<LittleEndian>(&mut words)?;
        self.words_remaining -= n as u64;
        Ok(words)
    }

    pub fn is_eof(&self) -> bool {
        self.words_remaining == 0
    }

    pub fn get_size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn get_filename(&self) -> &Path {
        &self.path
    }
}
