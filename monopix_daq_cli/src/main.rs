//! # monopix_daq_cli
//!
//! Part of the monopix_daq crate family.
//!
//! This is the command line application to decode and correlate Monopix
//! raw data. Progress is rendered with one bar per worker; detailed status
//! goes to the log file `monopix_daq.log`.
//!
//! ## Install
//!
//! Use `cargo install --path ./monopix_daq_cli`
//!
//! ## Use
//!
//! Make a template configuration, fill it out, then process:
//!
//! ```bash
//! monopix_daq_cli -p config.yaml new
//! monopix_daq_cli -p config.yaml
//! ```
use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use libmonopix_daq::config::Config;
use libmonopix_daq::error::ProcessorError;
use libmonopix_daq::process::{create_subsets, process_subset};
use libmonopix_daq::worker_status::{Stage, WorkerStatus};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Route all log output to a file so the terminal stays free for the
/// progress bars
fn setup_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./monopix_daq.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .unwrap(),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);
}

fn bar_style(stage: Stage) -> ProgressStyle {
    let color = match stage {
        Stage::Decoding => "cyan",
        Stage::Aligning => "magenta",
        Stage::Done => "green",
        Stage::Failed => "red",
    };
    ProgressStyle::with_template(&format!(
        "{{prefix:>12}} [{{bar:40.{color}}}] {{pos:>3}}% {{msg}}"
    ))
    .unwrap()
    .progress_chars("#>-")
}

fn main() {
    // Create a cli
    let matches = Command::new("monopix_daq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the config file"),
        )
        .get_matches();

    setup_logging();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if matches.subcommand_matches("new").is_some() {
        println!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        println!("Done.");
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Could not load config: {e}");
            spdlog::error!("{e}");
            return;
        }
    };
    if !config.is_n_threads_valid() {
        eprintln!("n_threads must be at least 1");
        return;
    }
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Raw Path: {}", config.raw_path.to_string_lossy());
    spdlog::info!("Output Path: {}", config.output_path.to_string_lossy());
    spdlog::info!(
        "First Run: {} Last Run: {}",
        config.first_run_number,
        config.last_run_number
    );

    // Spawn the workers
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let mut workers: Vec<JoinHandle<Result<(), ProcessorError>>> = Vec::new();
    let pb_manager = MultiProgress::new();
    let mut bars: Vec<ProgressBar> = Vec::new();

    for (idx, subset) in create_subsets(&config).into_iter().enumerate() {
        // Dont make empty workers
        if subset.is_empty() {
            continue;
        }
        let bar = pb_manager.add(ProgressBar::new(100));
        bar.set_style(bar_style(Stage::Decoding));
        bar.set_prefix(format!("worker {idx}"));
        bars.push(bar);

        let conf = config.clone();
        let worker_tx = tx.clone();
        workers.push(std::thread::spawn(move || {
            process_subset(conf, worker_tx, idx, subset)
        }));
    }
    drop(tx);

    // Render status updates until every worker hung up its sender
    while let Ok(status) = rx.recv() {
        if let Some(bar) = bars.get(status.worker_id) {
            bar.set_style(bar_style(status.stage));
            bar.set_position((status.progress * 100.0) as u64);
            bar.set_message(format!("run {} {:?}", status.run_number, status.stage));
        }
    }

    let mut any_failed = false;
    for worker in workers {
        match worker.join() {
            Ok(Ok(_)) => spdlog::info!("Worker complete"),
            Ok(Err(e)) => {
                any_failed = true;
                eprintln!("Processing failed: {e}");
                spdlog::error!("Processor error: {e}");
            }
            Err(_) => {
                any_failed = true;
                spdlog::error!("An error occured joining one of the workers!");
            }
        }
    }
    for bar in &bars {
        bar.finish();
    }

    if any_failed {
        println!("Finished with errors; check monopix_daq.log for details.");
    } else {
        println!("Successfully processed all runs.");
    }
}
