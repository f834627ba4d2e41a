use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::config::Config;
use super::constants::COL_TLU_HR;
use super::decoder::Decoder;
use super::error::ProcessorError;
use super::event_builder::align;
use super::fifo::{FifoDevice, ReplayFifo};
use super::hit::{read_hit_file, HitRecord};
use super::readout::{ChunkCallback, DataChunk, ErrorCallback, FifoReadout, ReadoutConfig, ReadoutFault};
use super::worker_status::{Stage, WorkerStatus};
use super::writer::{write_summary, EventWriter, HitWriter, RunSummary};

/// How long the readout gets to come down before a stop timeout is raised
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The main loop of monopix_daq offline processing.
///
/// Replays the recorded raw word stream of a run through the readout
/// engine, decodes it chunk-at-a-time with carried state, writes the hit
/// stream, then correlates against the reference plane (when configured)
/// and writes the event stream plus a match-quality summary.
pub fn process_run(
    config: &Config,
    run_number: i32,
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<(), ProcessorError> {
    let raw_path = config.get_raw_file_name(run_number);
    let replay = ReplayFifo::new(&raw_path)?;
    let total_bytes = replay.get_size_bytes();
    spdlog::info!(
        "Total run size: {}",
        human_bytes::human_bytes(total_bytes as f64)
    );
    let device = Arc::new(Mutex::new(replay));

    tx.send(WorkerStatus::new(0.0, run_number, *worker_id, Stage::Decoding))?;

    let mut decoder = Decoder::new(config.mode_mask);
    decoder.set_scan_param_id(config.scan_param_id);
    let decoder = Arc::new(Mutex::new(decoder));
    let hits = Arc::new(Mutex::new(Vec::<HitRecord>::new()));
    let faults = Arc::new(Mutex::new(Vec::<ReadoutFault>::new()));

    let callback: ChunkCallback = {
        let decoder = decoder.clone();
        let hits = hits.clone();
        Box::new(move |chunk: DataChunk| {
            let mut decoder = decoder.lock().unwrap();
            let mut hits = hits.lock().unwrap();
            let mut words = chunk.words.as_slice();
            while !words.is_empty() {
                let mut out = Vec::with_capacity(words.len());
                let consumed = decoder.decode(words, &mut out);
                hits.append(&mut out);
                words = &words[consumed..];
            }
            Ok(())
        })
    };
    let error_callback: ErrorCallback = {
        let faults = faults.clone();
        Box::new(move |fault| {
            spdlog::warn!("Readout fault: {fault}");
            faults.lock().unwrap().push(fault);
        })
    };

    let dyn_device: Arc<Mutex<dyn FifoDevice + Send>> = device.clone();
    let mut readout = FifoReadout::new(
        dyn_device,
        ReadoutConfig {
            poll_interval: config.poll_interval(),
            no_data_timeout: config.no_data_timeout(),
            moving_average_period: config.moving_average_period(),
            reset_on_start: true,
        },
    );

    let replay_start = Instant::now();
    readout.start(Some(callback), Some(error_callback))?;
    let mut progress: f32 = 0.0;
    let mut faults_seen = 0usize;
    loop {
        std::thread::sleep(config.poll_interval());

        // A hardware discard desyncs the word stream; the decoder state is
        // no longer trustworthy
        {
            let faults = faults.lock().unwrap();
            for fault in faults.iter().skip(faults_seen) {
                if matches!(fault, ReadoutFault::DataDiscarded { .. }) {
                    spdlog::warn!("Discard detected, resetting decoder state");
                    decoder.lock().unwrap().reset();
                }
            }
            faults_seen = faults.len();
        }

        let bytes_read = readout.get_record_count() * 4;
        let current = if total_bytes > 0 {
            (bytes_read as f32 / total_bytes as f32).min(1.0)
        } else {
            1.0
        };
        if current - progress >= 0.01 {
            progress = current;
            tx.send(WorkerStatus::new(
                progress,
                run_number,
                *worker_id,
                Stage::Decoding,
            ))?;
        }

        if device.lock().unwrap().is_exhausted() {
            break;
        }
    }
    readout.stop(STOP_TIMEOUT)?;
    tx.send(WorkerStatus::new(1.0, run_number, *worker_id, Stage::Decoding))?;

    let words_read = readout.get_record_count();
    let elapsed = replay_start.elapsed().as_secs_f64();
    spdlog::info!(
        "Replayed {} words in {:.1} s ({}/s)",
        words_read,
        elapsed,
        human_bytes::human_bytes(total_bytes as f64 / elapsed.max(f64::EPSILON))
    );

    let hits = std::mem::take(&mut *hits.lock().unwrap());
    let decoder_errors = decoder.lock().unwrap().error_count();
    if decoder_errors > 0 {
        spdlog::warn!("Decoder recovered from {decoder_errors} protocol errors");
    }

    let hit_path = config.get_hit_file_name(run_number)?;
    let mut hit_writer = HitWriter::new(&hit_path)?;
    hit_writer.write_all(&hits)?;
    hit_writer.close()?;

    // Event building needs TLU data in the stream; a plain source scan has
    // nothing to correlate
    let mut summary = RunSummary {
        run_number,
        words_read,
        decoder_errors,
        hit_records: hits.len() as u64,
        event_records: 0,
        degraded_fit: false,
        stages: Vec::new(),
    };
    if hits.iter().any(|h| h.col == COL_TLU_HR) {
        tx.send(WorkerStatus::new(0.0, run_number, *worker_id, Stage::Aligning))?;
        spdlog::info!("Now building events...");

        let reference = match config.get_reference_file_name(run_number) {
            Some(path) if path.exists() => read_hit_file(&path)?,
            Some(path) => {
                spdlog::warn!(
                    "Reference plane file {} does not exist; correlating without it",
                    path.display()
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let (events, alignment) = align(&hits, &reference, config, None)?;
        alignment.log();

        let event_path = config.get_event_file_name(run_number)?;
        let mut event_writer = EventWriter::new(&event_path)?;
        event_writer.write_all(&events)?;
        event_writer.close()?;

        summary.event_records = events.len() as u64;
        summary.degraded_fit = alignment.degraded_fit;
        summary.stages = alignment.stats;
        tx.send(WorkerStatus::new(1.0, run_number, *worker_id, Stage::Aligning))?;
    } else {
        spdlog::info!("No TLU data in run {run_number}; skipping event building");
    }

    write_summary(&config.get_summary_file_name(run_number)?, &summary)?;
    tx.send(WorkerStatus::new(1.0, run_number, *worker_id, Stage::Done))?;
    Ok(())
}

/// The function to be called by a separate thread (typically the UI).
/// Allows multiple runs to be processed
pub fn process(
    config: Config,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<(), ProcessorError> {
    for run in config.first_run_number..(config.last_run_number + 1) {
        if config.does_run_exist(run) {
            spdlog::info!("Processing run {}...", run);
            process_run(&config, run, &tx, &worker_id)?;
            spdlog::info!("Finished processing run {}.", run);
        } else {
            spdlog::info!("Run {} does not exist, skipping...", run);
        }
    }
    Ok(())
}

/// Process a subset of runs
pub fn process_subset(
    config: Config,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
    subset: Vec<i32>,
) -> Result<(), ProcessorError> {
    for run in subset {
        if config.does_run_exist(run) {
            spdlog::info!("Processing run {}...", run);
            process_run(&config, run, &tx, &worker_id)?;
            spdlog::info!("Finished processing run {}.", run);
        } else {
            spdlog::info!("Run {} does not exist, skipping...", run);
        }
    }
    Ok(())
}

/// Divide a run range in to a set of subranges (per thread/worker)
pub fn create_subsets(config: &Config) -> Vec<Vec<i32>> {
    let mut subsets: Vec<Vec<i32>> = vec![Vec::new(); config.n_threads as usize];
    let n_subsets = subsets.len();

    for (idx, run) in (config.first_run_number..(config.last_run_number + 1)).enumerate() {
        subsets[idx % n_subsets].push(run)
    }

    subsets
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_subsets_round_robin() {
        let config = Config {
            first_run_number: 1,
            last_run_number: 5,
            n_threads: 2,
            ..Default::default()
        };
        let subsets = create_subsets(&config);
        assert_eq!(subsets, vec![vec![1, 3, 5], vec![2, 4]]);
    }

    #[test]
    fn test_create_subsets_more_workers_than_runs() {
        let config = Config {
            first_run_number: 7,
            last_run_number: 8,
            n_threads: 4,
            ..Default::default()
        };
        let subsets = create_subsets(&config);
        assert_eq!(subsets[0], vec![7]);
        assert_eq!(subsets[1], vec![8]);
        assert!(subsets[2].is_empty());
        assert!(subsets[3].is_empty());
    }
}
