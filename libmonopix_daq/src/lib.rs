//! # monopix_daq
//!
//! monopix_daq is the host-side acquisition and event building pipeline for
//! the Monopix pixel detector readout, written in Rust. It drains the raw
//! word FIFO of the readout board (or replays a recorded raw file),
//! reconstructs timestamped hit records from the bit-tagged word protocol,
//! correlates them against the trigger logic unit (TLU), the scintillator
//! reference and an optional reference detector plane, and writes
//! correlated physics events.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust
//! before, you will most likely need to install the Rust tool chain. See
//! the [Rust docs](https://www.rust-lang.org/tools/install) for
//! installation instructions.
//!
//! To build and install the CLI use `cargo install --path ./monopix_daq_cli`
//! from the top level monopix_daq repository. The binary will be installed
//! to your cargo install location (typically something like
//! `~/.cargo/bin/`) and can be uninstalled with
//! `cargo uninstall monopix_daq_cli`.
//!
//! ## Pipeline
//!
//! ```text
//! hardware FIFO / recorded .raw file
//!         |
//!         v
//! FifoReadout (reader thread) --chunks--> worker thread
//!         |                                   |
//!     watchdog thread                     Decoder (stateful, chunk at a time)
//!                                             |
//!                                         hit record stream
//!                                             |
//!                                 alignment + event building
//!                                             |
//!                                 event records, run summary
//! ```
//!
//! The readout engine is the only concurrent component. The decoder and the
//! event builder are strictly sequential; the decoder carries its state
//! across chunk boundaries so streaming and offline decoding produce
//! identical output.
//!
//! ## Configuration
//!
//! Configurations are YAML files, compatible between the library and the
//! CLI. The format is as follows:
//!
//! ```yml
//! raw_path: None
//! reference_path: null
//! output_path: None
//! first_run_number: 0
//! last_run_number: 0
//! n_threads: 1
//! scan_param_id: 0
//! mode_mask: 3
//! poll_interval_ms: 50
//! no_data_timeout_s: 10.0
//! moving_average_period_s: 10
//! search_distance: 100
//! on_fit_failure: moments
//! ```
//!
//! - `raw_path`: directory containing the recorded raw word streams, one
//!   `run_####.raw` file per run (flat little-endian u32 words).
//! - `reference_path` (optional): directory with `run_####_reference.bin`
//!   reference-plane hit streams.
//! - `output_path`: directory to which hit, event and summary files are
//!   written.
//! - `first_run_number`/`last_run_number`: the run range (inclusive).
//! - `n_threads`: number of parallel workers the runs are divided amongst.
//!   If you don't have enough runs to give all workers something to do,
//!   only the threads that would do work are created. Must be at least 1.
//! - `mode_mask`: decoder channel gating; bit 0x1 enables the 40 MHz
//!   timestamp channel, bit 0x2 the TLU trigger channel.
//! - `on_fit_failure`: `moments` keeps going with the method-of-moments
//!   window and flags the run as degraded; `abort` fails the alignment.
//!
//! ## Output
//!
//! Per run three files are produced in `output_path`:
//!
//! ```text
//! run_0001_hits.bin     decoded hit records, 21 bytes each, little-endian
//! run_0001_events.bin   correlated event records, 21 bytes each
//! run_0001_summary.yml  match accounting per pipeline stage
//! ```
//!
//! The log file contains the detailed status of each run; if an error
//! occurs the log will indicate the issue. It is not advised to delete the
//! log files.
pub mod alignment;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod error;
pub mod event;
pub mod event_builder;
pub mod fifo;
pub mod fit;
pub mod hit;
pub mod process;
pub mod raw_file;
pub mod readout;
pub mod worker_status;
pub mod writer;
