//! Runtime knobs that do not come from configuration.yaml

use std::path::PathBuf;
use std::time::Duration;

/// How the kernel runs, as opposed to what it runs
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding configuration.yaml
    pub config_dir: PathBuf,
    /// Executor pool size; `None` uses the available parallelism
    pub workers: Option<usize>,
    /// Upper bound for one integration's setup
    pub setup_timeout: Duration,
    /// How long `start` waits for work queued by `openpeerpower_start`
    pub start_timeout: Duration,
    /// How long `stop` waits for pending work before closing the loop
    pub stop_timeout: Duration,
    /// Fire `time_changed` every whole second from the clock
    pub tick: bool,
}

impl RuntimeConfig {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            ..Self::default()
        }
    }

    /// A runtime driven entirely by explicit `time_changed` events
    pub fn without_tick(mut self) -> Self {
        self.tick = false;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            workers: None,
            setup_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(30),
            tick: true,
        }
    }
}
