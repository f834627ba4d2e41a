use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::alignment::MatchStats;
use super::error::WriterError;
use super::event::EventRecord;
use super::hit::HitRecord;

/// Append-only writer for the decoded hit-record stream.
#[derive(Debug)]
pub struct HitWriter {
    handle: BufWriter<File>,
    path: PathBuf,
    count: u64,
}

impl HitWriter {
    pub fn new(path: &Path) -> Result<Self, WriterError> {
        Ok(Self {
            handle: BufWriter::new(File::create(path)?),
            path: path.to_path_buf(),
            count: 0,
        })
    }

    pub fn write_record(&mut self, hit: &HitRecord) -> Result<(), WriterError> {
        hit.write_to(&mut self.handle)?;
        self.count += 1;
        Ok(())
    }

    pub fn write_all(&mut self, hits: &[HitRecord]) -> Result<(), WriterError> {
        for hit in hits {
            self.write_record(hit)?;
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush and consume the writer, logging the total
    pub fn close(mut self) -> Result<(), WriterError> {
        self.handle.flush()?;
        spdlog::info!(
            "{} hit records written to {}",
            self.count,
            self.path.display()
        );
        Ok(())
    }
}

/// Append-only writer for the correlated event stream.
#[derive(Debug)]
pub struct EventWriter {
    handle: BufWriter<File>,
    path: PathBuf,
    count: u64,
}

impl EventWriter {
    pub fn new(path: &Path) -> Result<Self, WriterError> {
        Ok(Self {
            handle: BufWriter::new(File::create(path)?),
            path: path.to_path_buf(),
            count: 0,
        })
    }

    pub fn write_all(&mut self, events: &[EventRecord]) -> Result<(), WriterError> {
        for event in events {
            event.write_to(&mut self.handle)?;
            self.count += 1;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(), WriterError> {
        self.handle.flush()?;
        spdlog::info!(
            "{} event records written to {}",
            self.count,
            self.path.display()
        );
        Ok(())
    }
}

/// Per-run bookkeeping written as a YAML sidecar next to the data files.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_number: i32,
    pub words_read: u64,
    pub decoder_errors: u64,
    pub hit_records: u64,
    pub event_records: u64,
    pub degraded_fit: bool,
    pub stages: Vec<MatchStats>,
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), WriterError> {
    let mut file = File::create(path)?;
    file.write_all(serde_yaml::to_string(summary)?.as_bytes())?;
    Ok(())
}
