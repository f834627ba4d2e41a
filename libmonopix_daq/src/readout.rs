use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::constants::{CHUNK_QUEUE_DEPTH, WATCHDOG_MULTIPLIER};
use super::error::ReadoutError;
use super::fifo::FifoDevice;

/// One drained FIFO chunk with provenance: wall-clock start/stop stamps of
/// the read that produced it and a status flag (nonzero when the preceding
/// read attempt faulted).
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub words: Vec<u32>,
    pub start: f64,
    pub stop: f64,
    pub status: u32,
}

/// Faults surfaced through the error callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadoutFault {
    /// The FIFO read primitive failed; the reader retries unless a stop was
    /// requested
    ReadError(String),
    /// No non-empty chunk arrived within the configured window; fires once
    /// per start
    NoDataTimeout,
    /// The reader did not come down within the stop timeout; fires once
    StopTimeout,
    /// The hardware dropped words on a receiver channel; re-raised every
    /// watchdog cycle while the counter stays nonzero
    DataDiscarded { channel: String, count: u32 },
    /// The consumer callback failed on a chunk
    CallbackError(String),
}

impl std::fmt::Display for ReadoutFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadoutFault::ReadError(e) => write!(f, "FIFO read failed: {e}"),
            ReadoutFault::NoDataTimeout => write!(f, "no data received within timeout"),
            ReadoutFault::StopTimeout => write!(f, "reader did not stop within timeout"),
            ReadoutFault::DataDiscarded { channel, count } => {
                write!(f, "receiver {channel} discarded {count} words")
            }
            ReadoutFault::CallbackError(e) => write!(f, "chunk consumer failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopping,
}

pub type ChunkCallback =
    Box<dyn FnMut(DataChunk) -> Result<(), Box<dyn std::error::Error>> + Send>;
pub type ErrorCallback = Box<dyn Fn(ReadoutFault) + Send + Sync>;

/// Tuning knobs of the acquisition loop.
#[derive(Debug, Clone)]
pub struct ReadoutConfig {
    pub poll_interval: Duration,
    pub no_data_timeout: Option<Duration>,
    pub moving_average_period: Duration,
    /// Reset the FIFO and receivers on start
    pub reset_on_start: bool,
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            no_data_timeout: Some(Duration::from_secs(10)),
            moving_average_period: Duration::from_secs(10),
            reset_on_start: true,
        }
    }
}

/// The FIFO readout engine.
///
/// Drains the device at a fixed polling cadence on a background reader
/// thread and hands timestamped chunks to a consumer callback running on a
/// separate worker thread, decoupled through a bounded queue. A watchdog
/// thread polls the hardware discard counters when an error callback is
/// registered. See the module-level notes in `lib.rs` for the full state
/// machine.
pub struct FifoReadout {
    device: Arc<Mutex<dyn FifoDevice + Send>>,
    config: ReadoutConfig,
    state: Arc<Mutex<RunState>>,
    stop_readout: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    record_count: Arc<Mutex<u64>>,
    calculate_tx: Option<mpsc::Sender<SyncSender<f64>>>,
    reader_done_rx: Option<Receiver<()>>,
    reader_handle: Option<JoinHandle<()>>,
    worker_handle: Option<JoinHandle<()>>,
    watchdog_handle: Option<JoinHandle<()>>,
    active_error_callback: Option<Arc<ErrorCallback>>,
}

impl FifoReadout {
    pub fn new(device: Arc<Mutex<dyn FifoDevice + Send>>, config: ReadoutConfig) -> Self {
        Self {
            device,
            config,
            state: Arc::new(Mutex::new(RunState::Idle)),
            stop_readout: Arc::new(AtomicBool::new(false)),
            force_stop: Arc::new(AtomicBool::new(false)),
            record_count: Arc::new(Mutex::new(0)),
            calculate_tx: None,
            reader_done_rx: None,
            reader_handle: None,
            worker_handle: None,
            watchdog_handle: None,
            active_error_callback: None,
        }
    }

    /// Total raw words received since the counter was last set
    pub fn get_record_count(&self) -> u64 {
        *self.record_count.lock().unwrap()
    }

    pub fn set_record_count(&self, count: u64) {
        *self.record_count.lock().unwrap() = count;
    }

    /// Current throughput in words per second, averaged over the moving
    /// window. Answered by the reader between polls through a single-slot
    /// reply channel; `None` when the reader does not answer in time or no
    /// readout is running.
    pub fn data_rate(&self, timeout: Duration) -> Option<f64> {
        let tx = self.calculate_tx.as_ref()?;
        let (reply_tx, reply_rx) = mpsc::sync_channel::<f64>(1);
        tx.send(reply_tx).ok()?;
        reply_rx.recv_timeout(timeout).ok()
    }

    /// Spawn the reader (always), worker (when a consumer callback is
    /// given) and watchdog (when an error callback is given) and begin
    /// draining the FIFO.
    pub fn start(
        &mut self,
        callback: Option<ChunkCallback>,
        error_callback: Option<ErrorCallback>,
    ) -> Result<(), ReadoutError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != RunState::Idle {
                return Err(ReadoutError::AlreadyRunning);
            }
            *state = RunState::Running;
        }
        self.stop_readout.store(false, Ordering::SeqCst);
        self.force_stop.store(false, Ordering::SeqCst);

        if self.config.reset_on_start {
            self.device.lock().unwrap().reset()?;
        }

        let error_cb = error_callback.map(Arc::new);
        self.active_error_callback = error_cb.clone();

        let (chunk_tx, chunk_rx) = mpsc::sync_channel::<Option<DataChunk>>(CHUNK_QUEUE_DEPTH);
        let (calc_tx, calc_rx) = mpsc::channel::<SyncSender<f64>>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        self.calculate_tx = Some(calc_tx);
        self.reader_done_rx = Some(done_rx);

        // Without a consumer there is nowhere to hand chunks to; the reader
        // then only keeps the accounting.
        let chunk_tx = callback.as_ref().map(|_| chunk_tx);

        // Reader task
        {
            let device = self.device.clone();
            let config = self.config.clone();
            let stop_readout = self.stop_readout.clone();
            let force_stop = self.force_stop.clone();
            let record_count = self.record_count.clone();
            let error_cb = error_cb.clone();
            self.reader_handle = Some(std::thread::spawn(move || {
                reader_task(
                    device,
                    config,
                    chunk_tx,
                    calc_rx,
                    done_tx,
                    stop_readout,
                    force_stop,
                    record_count,
                    error_cb,
                );
            }));
        }

        // Worker task
        if let Some(mut callback) = callback {
            let poll_interval = self.config.poll_interval;
            let force_stop = self.force_stop.clone();
            let error_cb = error_cb.clone();
            self.worker_handle = Some(std::thread::spawn(move || loop {
                match chunk_rx.recv_timeout(poll_interval) {
                    Ok(Some(chunk)) => {
                        if let Err(e) = callback(chunk) {
                            if let Some(cb) = &error_cb {
                                cb(ReadoutFault::CallbackError(e.to_string()));
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if force_stop.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }));
        }

        // Watchdog task
        if let Some(error_cb) = error_cb {
            let device = self.device.clone();
            let stop_readout = self.stop_readout.clone();
            let poll_interval = self.config.poll_interval;
            self.watchdog_handle = Some(std::thread::spawn(move || {
                watchdog_task(device, poll_interval, stop_readout, error_cb);
            }));
        }

        Ok(())
    }

    /// Request a graceful stop and join all tasks.
    ///
    /// If the reader does not come down within `timeout` a one-shot
    /// stop-timeout fault is reported and the reader is forced to abort at
    /// its next check; the remaining joins are best effort.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), ReadoutError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != RunState::Running {
                return Err(ReadoutError::NotRunning);
            }
            *state = RunState::Stopping;
        }
        self.stop_readout.store(true, Ordering::SeqCst);

        if let Some(done_rx) = self.reader_done_rx.take() {
            if done_rx.recv_timeout(timeout).is_err() {
                if let Some(cb) = &self.active_error_callback {
                    cb(ReadoutFault::StopTimeout);
                }
                self.force_stop.store(true, Ordering::SeqCst);
            }
        }

        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.watchdog_handle.take() {
            let _ = handle.join();
        }

        self.calculate_tx = None;
        self.active_error_callback = None;
        *self.state.lock().unwrap() = RunState::Idle;
        Ok(())
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

fn window_rate(window: &VecDeque<(Instant, usize)>) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let span = window
        .back()
        .unwrap()
        .0
        .duration_since(window.front().unwrap().0)
        .as_secs_f64();
    if span <= 0.0 {
        return 0.0;
    }
    let total: usize = window.iter().map(|(_, n)| n).sum();
    total as f64 / span
}

#[allow(clippy::too_many_arguments)]
fn reader_task(
    device: Arc<Mutex<dyn FifoDevice + Send>>,
    config: ReadoutConfig,
    chunk_tx: Option<SyncSender<Option<DataChunk>>>,
    calc_rx: Receiver<SyncSender<f64>>,
    done_tx: mpsc::Sender<()>,
    stop_readout: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    record_count: Arc<Mutex<u64>>,
    error_cb: Option<Arc<ErrorCallback>>,
) {
    let window_capacity = (config.moving_average_period.as_secs_f64()
        / config.poll_interval.as_secs_f64())
    .max(1.0) as usize;
    let mut window: VecDeque<(Instant, usize)> = VecDeque::with_capacity(window_capacity);
    let mut last_data = Instant::now();
    let mut timeout_fired = false;
    let mut pending_status: u32 = 0;

    loop {
        if force_stop.load(Ordering::SeqCst) {
            // forego the sentinel, the worker exits on its own
            break;
        }
        let iteration_start = Instant::now();

        // Answer pending throughput queries between polls
        while let Ok(reply) = calc_rx.try_recv() {
            let _ = reply.try_send(window_rate(&window));
        }

        let chunk_start = unix_now();
        let read_result = device.lock().unwrap().read_data();
        let chunk_stop = unix_now();

        match read_result {
            Ok(words) => {
                if window.len() == window_capacity {
                    window.pop_front();
                }
                window.push_back((Instant::now(), words.len()));
                if !words.is_empty() {
                    last_data = Instant::now();
                    *record_count.lock().unwrap() += words.len() as u64;
                    let chunk = DataChunk {
                        words,
                        start: chunk_start,
                        stop: chunk_stop,
                        status: pending_status,
                    };
                    pending_status = 0;
                    if let Some(tx) = &chunk_tx {
                        if tx.send(Some(chunk)).is_err() {
                            break;
                        }
                    }
                } else if let Some(no_data) = config.no_data_timeout {
                    if !timeout_fired && last_data.elapsed() > no_data {
                        timeout_fired = true;
                        if let Some(cb) = &error_cb {
                            cb(ReadoutFault::NoDataTimeout);
                        }
                    }
                }
            }
            Err(e) => {
                pending_status = 1;
                if let Some(cb) = &error_cb {
                    cb(ReadoutFault::ReadError(e.to_string()));
                }
                if stop_readout.load(Ordering::SeqCst) {
                    break;
                }
            }
        }

        if stop_readout.load(Ordering::SeqCst) {
            break;
        }
        let elapsed = iteration_start.elapsed();
        if elapsed < config.poll_interval {
            std::thread::sleep(config.poll_interval - elapsed);
        }
    }

    if !force_stop.load(Ordering::SeqCst) {
        if let Some(tx) = &chunk_tx {
            let _ = tx.send(None);
        }
    }
    let _ = done_tx.send(());
}

fn watchdog_task(
    device: Arc<Mutex<dyn FifoDevice + Send>>,
    poll_interval: Duration,
    stop_readout: Arc<AtomicBool>,
    error_cb: Arc<ErrorCallback>,
) {
    let period = poll_interval * WATCHDOG_MULTIPLIER;
    loop {
        // sleep in poll-interval slices so a stop is noticed promptly
        let deadline = Instant::now() + period;
        loop {
            if stop_readout.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(poll_interval.min(deadline - now));
        }
        match device.lock().unwrap().discard_counters() {
            Ok(counters) => {
                for (channel, count) in counters {
                    if count != 0 {
                        error_cb(ReadoutFault::DataDiscarded { channel, count });
                    }
                }
            }
            Err(e) => error_cb(ReadoutFault::ReadError(e.to_string())),
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FifoError;
    use fxhash::FxHashMap;

    /// Scripted FIFO standing in for the hardware accessor
    struct MockFifo {
        chunks: VecDeque<Vec<u32>>,
        discards: FxHashMap<String, u32>,
    }

    impl MockFifo {
        fn new(chunks: Vec<Vec<u32>>) -> Self {
            Self {
                chunks: chunks.into(),
                discards: FxHashMap::default(),
            }
        }
    }

    impl FifoDevice for MockFifo {
        fn read_data(&mut self) -> Result<Vec<u32>, FifoError> {
            Ok(self.chunks.pop_front().unwrap_or_default())
        }

        fn discard_counters(&mut self) -> Result<FxHashMap<String, u32>, FifoError> {
            Ok(self.discards.clone())
        }

        fn reset(&mut self) -> Result<(), FifoError> {
            Ok(())
        }
    }

    fn fast_config() -> ReadoutConfig {
        ReadoutConfig {
            poll_interval: Duration::from_millis(1),
            no_data_timeout: None,
            moving_average_period: Duration::from_millis(100),
            reset_on_start: true,
        }
    }

    #[test]
    fn test_chunks_delivered_in_order() {
        let device: Arc<Mutex<dyn FifoDevice + Send>> = Arc::new(Mutex::new(MockFifo::new(vec![
            vec![1, 2, 3],
            vec![4, 5],
            vec![6],
        ])));
        let mut readout = FifoReadout::new(device, fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        readout
            .start(
                Some(Box::new(move |chunk: DataChunk| {
                    sink.lock().unwrap().extend(chunk.words);
                    Ok(())
                })),
                None,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        readout.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(readout.get_record_count(), 6);
    }

    #[test]
    fn test_start_twice_fails() {
        let device: Arc<Mutex<dyn FifoDevice + Send>> =
            Arc::new(Mutex::new(MockFifo::new(vec![])));
        let mut readout = FifoReadout::new(device, fast_config());
        readout.start(None, None).unwrap();
        assert!(matches!(
            readout.start(None, None),
            Err(ReadoutError::AlreadyRunning)
        ));
        readout.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_stop_without_start_fails() {
        let device: Arc<Mutex<dyn FifoDevice + Send>> =
            Arc::new(Mutex::new(MockFifo::new(vec![])));
        let mut readout = FifoReadout::new(device, fast_config());
        assert!(matches!(
            readout.stop(Duration::from_secs(1)),
            Err(ReadoutError::NotRunning)
        ));
    }

    #[test]
    fn test_no_data_timeout_fires_once() {
        let device: Arc<Mutex<dyn FifoDevice + Send>> =
            Arc::new(Mutex::new(MockFifo::new(vec![])));
        let mut config = fast_config();
        config.no_data_timeout = Some(Duration::from_millis(5));
        let mut readout = FifoReadout::new(device, config);
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        readout
            .start(
                None,
                Some(Box::new(move |fault| sink.lock().unwrap().push(fault))),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        readout.stop(Duration::from_secs(1)).unwrap();
        let timeouts = faults
            .lock()
            .unwrap()
            .iter()
            .filter(|f| **f == ReadoutFault::NoDataTimeout)
            .count();
        assert_eq!(timeouts, 1);
    }

    #[test]
    fn test_watchdog_reports_discards() {
        let mut mock = MockFifo::new(vec![]);
        mock.discards.insert(String::from("rx0"), 3);
        let device: Arc<Mutex<dyn FifoDevice + Send>> = Arc::new(Mutex::new(mock));
        let mut readout = FifoReadout::new(device, fast_config());
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        readout
            .start(
                None,
                Some(Box::new(move |fault| sink.lock().unwrap().push(fault))),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        readout.stop(Duration::from_secs(1)).unwrap();
        assert!(faults.lock().unwrap().iter().any(|f| matches!(
            f,
            ReadoutFault::DataDiscarded { channel, count: 3 } if channel == "rx0"
        )));
    }

    #[test]
    fn test_data_rate_query() {
        let chunks = (0..64).map(|_| vec![0u32; 128]).collect();
        let device: Arc<Mutex<dyn FifoDevice + Send>> =
            Arc::new(Mutex::new(MockFifo::new(chunks)));
        let mut readout = FifoReadout::new(device, fast_config());
        readout.start(Some(Box::new(|_| Ok(()))), None).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let rate = readout.data_rate(Duration::from_millis(500));
        readout.stop(Duration::from_secs(1)).unwrap();
        assert!(rate.is_some());
        assert!(rate.unwrap() > 0.0);
    }

    #[test]
    fn test_callback_error_is_routed() {
        let device: Arc<Mutex<dyn FifoDevice + Send>> =
            Arc::new(Mutex::new(MockFifo::new(vec![vec![1]])));
        let mut readout = FifoReadout::new(device, fast_config());
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        readout
            .start(
                Some(Box::new(|_| Err("decode exploded".into()))),
                Some(Box::new(move |fault| sink.lock().unwrap().push(fault))),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        readout.stop(Duration::from_secs(1)).unwrap();
        assert!(faults
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, ReadoutFault::CallbackError(_))));
    }
}
