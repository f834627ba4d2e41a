/// Which stage of a run a worker is currently in. The UI maps stages to
/// bar styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Decoding,
    Aligning,
    Done,
    Failed,
}

/// Progress message sent from a processing worker to the UI thread.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub run_number: i32,
    pub worker_id: usize,
    pub stage: Stage,
}

impl WorkerStatus {
    pub fn new(progress: f32, run_number: i32, worker_id: usize, stage: Stage) -> Self {
        Self {
            progress,
            run_number,
            worker_id,
            stage,
        }
    }
}
