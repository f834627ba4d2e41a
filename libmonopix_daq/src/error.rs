use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum FifoError {
    #[error("FIFO device failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("FIFO device reported a fault: {0}")]
    DeviceFault(String),
}

#[derive(Debug, Error)]
pub enum RawFileError {
    #[error("Could not open raw data file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Reached end of raw data file")]
    EndOfFile,
    #[error("Raw data file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HitFileError {
    #[error("Could not open hit file because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Hit file ends mid-record; the file is truncated")]
    TruncatedRecord,
    #[error("Hit file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReadoutError {
    #[error("Readout was started while already running")]
    AlreadyRunning,
    #[error("Readout was stopped while not running")]
    NotRunning,
    #[error("Readout failed due to FIFO error: {0}")]
    FifoError(#[from] FifoError),
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Cannot fit an empty histogram")]
    EmptyHistogram,
    #[error("Box fit did not converge after {0} iterations")]
    NoConvergence(usize),
}

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Overflow-corrected {name} is not strictly increasing at index {index}")]
    MonotonicityViolation { name: &'static str, index: usize },
    #[error("Alignment requires a non-empty {0} stream")]
    EmptyStream(&'static str),
    #[error("Offset estimation failed and the fit-failure policy is abort: {0}")]
    FitFailed(#[from] FitError),
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Writer failed to convert summary to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config field {0} is invalid: {1}")]
    BadField(&'static str, String),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to raw file error: {0}")]
    RawFileError(#[from] RawFileError),
    #[error("Processor failed due to hit file error: {0}")]
    HitFileError(#[from] HitFileError),
    #[error("Processor failed due to readout error: {0}")]
    ReadoutError(#[from] ReadoutError),
    #[error("Processor failed due to alignment error: {0}")]
    AlignmentError(#[from] AlignmentError),
    #[error("Processor failed due to writer error: {0}")]
    WriterError(#[from] WriterError),
    #[error("Processor failed due to config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
