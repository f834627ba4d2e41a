use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// What to do when the robust box fit of a timestamp-difference histogram
/// fails to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FitFailurePolicy {
    /// Derive the acceptance window from the method-of-moments estimate and
    /// flag the run as degraded in the summary
    #[default]
    Moments,
    /// Abort the alignment pass
    Abort,
}

/// Structure representing the application configuration. Contains pathing,
/// run range and pipeline tuning parameters.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub raw_path: PathBuf,
    pub reference_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub first_run_number: i32,
    pub last_run_number: i32,
    pub n_threads: i32,
    pub scan_param_id: i32,
    /// Decoder mode mask; bit 0x1 enables the 40 MHz channel, bit 0x2 the TLU channel
    pub mode_mask: u8,
    pub poll_interval_ms: u64,
    /// Seconds without a non-empty chunk before the one-shot timeout fault
    pub no_data_timeout_s: Option<f64>,
    pub moving_average_period_s: u64,
    /// Words scanned around an anchor during windowed matching
    pub search_distance: usize,
    pub on_fit_failure: FitFailurePolicy,
}

impl Default for Config {
    /// Generate a new Config object. Path fields will be empty/invalid
    fn default() -> Self {
        Self {
            raw_path: PathBuf::from("None"),
            reference_path: None,
            output_path: PathBuf::from("None"),
            first_run_number: 0,
            last_run_number: 0,
            n_threads: 1,
            scan_param_id: 0,
            mode_mask: 0x3,
            poll_interval_ms: 50,
            no_data_timeout_s: Some(10.0),
            moving_average_period_s: 10,
            search_distance: 100,
            on_fit_failure: FitFailurePolicy::Moments,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        if config.poll_interval_ms == 0 {
            return Err(ConfigError::BadField(
                "poll_interval_ms",
                String::from("must be nonzero"),
            ));
        }
        if config.search_distance == 0 {
            return Err(ConfigError::BadField(
                "search_distance",
                String::from("must be nonzero"),
            ));
        }
        Ok(config)
    }

    /// Check if a specific run exists by evaluating the existence of raw data.
    /// Reference-plane data is optional
    pub fn does_run_exist(&self, run_number: i32) -> bool {
        self.get_raw_file_name(run_number).exists()
    }

    /// Path to the recorded raw word stream of a run
    pub fn get_raw_file_name(&self, run_number: i32) -> PathBuf {
        self.raw_path.join(format!("{}.raw", self.get_run_str(run_number)))
    }

    /// Path to the reference-plane hit stream of a run, if a reference
    /// directory is configured
    pub fn get_reference_file_name(&self, run_number: i32) -> Option<PathBuf> {
        self.reference_path
            .as_ref()
            .map(|p| p.join(format!("{}_reference.bin", self.get_run_str(run_number))))
    }

    /// Path to the decoded hit-record output of a run
    pub fn get_hit_file_name(&self, run_number: i32) -> Result<PathBuf, ConfigError> {
        if !self.output_path.exists() {
            return Err(ConfigError::BadFilePath(self.output_path.clone()));
        }
        Ok(self
            .output_path
            .join(format!("{}_hits.bin", self.get_run_str(run_number))))
    }

    /// Path to the correlated event output of a run
    pub fn get_event_file_name(&self, run_number: i32) -> Result<PathBuf, ConfigError> {
        if !self.output_path.exists() {
            return Err(ConfigError::BadFilePath(self.output_path.clone()));
        }
        Ok(self
            .output_path
            .join(format!("{}_events.bin", self.get_run_str(run_number))))
    }

    /// Path to the match-quality summary sidecar of a run
    pub fn get_summary_file_name(&self, run_number: i32) -> Result<PathBuf, ConfigError> {
        if !self.output_path.exists() {
            return Err(ConfigError::BadFilePath(self.output_path.clone()));
        }
        Ok(self
            .output_path
            .join(format!("{}_summary.yml", self.get_run_str(run_number))))
    }

    /// Construct the run string using the DAQ format
    fn get_run_str(&self, run_number: i32) -> String {
        format!("run_{run_number:0>4}")
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }

    pub fn has_reference_path(&self) -> bool {
        self.reference_path.is_some()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn no_data_timeout(&self) -> Option<Duration> {
        self.no_data_timeout_s.map(Duration::from_secs_f64)
    }

    pub fn moving_average_period(&self) -> Duration {
        Duration::from_secs(self.moving_average_period_s)
    }
}
