use fxhash::FxHashMap;
use std::path::Path;

use super::constants::REPLAY_CHUNK_WORDS;
use super::error::{FifoError, RawFileError};
use super::raw_file::RawFile;

/// The hardware boundary of the readout engine.
///
/// Implementations wrap the actual bus accessor of the readout board. The
/// engine only ever calls these three primitives; everything else about the
/// hardware (register programming, power sequencing) lives with the
/// implementor.
pub trait FifoDevice {
    /// Drain whatever the FIFO currently holds. An empty chunk is a valid
    /// result and simply means no data arrived since the last poll.
    fn read_data(&mut self) -> Result<Vec<u32>, FifoError>;

    /// Per-receiver-channel counters of words the hardware had to drop.
    /// Any nonzero value is a fault condition.
    fn discard_counters(&mut self) -> Result<FxHashMap<String, u32>, FifoError>;

    /// Clear the FIFO and reset the receivers.
    fn reset(&mut self) -> Result<(), FifoError>;
}

/// A [FifoDevice] backed by a recorded raw file, so offline runs exercise
/// the identical acquisition path as live data taking.
#[derive(Debug)]
pub struct ReplayFifo {
    file: RawFile,
    exhausted: bool,
}

impl ReplayFifo {
    pub fn new(path: &Path) -> Result<Self, RawFileError> {
        Ok(Self {
            file: RawFile::new(path)?,
            exhausted: false,
        })
    }

    /// True once every recorded word has been served
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn get_size_bytes(&self) -> u64 {
        self.file.get_size_bytes()
    }
}

impl FifoDevice for ReplayFifo {
    fn read_data(&mut self) -> Result<Vec<u32>, FifoError> {
        match self.file.read_chunk(REPLAY_CHUNK_WORDS) {
            Ok(words) => Ok(words),
            Err(RawFileError::EndOfFile) => {
                self.exhausted = true;
                Ok(Vec::new())
            }
            Err(RawFileError::IOError(e)) => Err(FifoError::IOError(e)),
            Err(RawFileError::BadFilePath(p)) => {
                Err(FifoError::DeviceFault(format!("replay file vanished: {p:?}")))
            }
        }
    }

    fn discard_counters(&mut self) -> Result<FxHashMap<String, u32>, FifoError> {
        // A recorded stream cannot drop words
        Ok(FxHashMap::default())
    }

    fn reset(&mut self) -> Result<(), FifoError> {
        Ok(())
    }
}
