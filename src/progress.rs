use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Receives throttled progress readings.
pub trait ProgressReporter: Send + Sync {
    fn update(&self, processed: u64);

    fn finish(&self, processed: u64) {
        self.update(processed);
    }
}

/// Reporter that ignores every reading.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn update(&self, _processed: u64) {}
}

impl ProgressReporter for indicatif::ProgressBar {
    fn update(&self, processed: u64) {
        self.set_position(processed);
    }

    fn finish(&self, processed: u64) {
        self.set_position(processed);
        indicatif::ProgressBar::finish(self);
    }
}

#[derive(Debug)]
struct Counter {
    processed: u64,
    last_refresh: Instant,
}

/// Per-scan processed-target counter.
///
/// Every worker bumps it once per target; the reporter is only called every
/// `batch` increments or once `interval` has passed since the last call.
pub struct ProgressTracker {
    counter: Mutex<Counter>,
    batch: u64,
    interval: Duration,
    reporter: Arc<dyn ProgressReporter>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>, batch: u64, interval: Duration) -> Self {
        Self {
            counter: Mutex::new(Counter {
                processed: 0,
                last_refresh: Instant::now(),
            }),
            batch: batch.max(1),
            interval,
            reporter,
        }
    }

    pub fn increment(&self) {
        let mut counter = self
            .counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counter.processed += 1;
        if counter.processed % self.batch == 0 || counter.last_refresh.elapsed() >= self.interval {
            self.reporter.update(counter.processed);
            counter.last_refresh = Instant::now();
        }
    }

    pub fn processed(&self) -> u64 {
        self.counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .processed
    }

    /// Push the final count to the reporter regardless of throttling.
    pub fn finish(&self) -> u64 {
        let processed = self.processed();
        self.reporter.finish(processed);
        processed
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("processed", &self.processed())
            .field("batch", &self.batch)
            .field("interval", &self.interval)
            .finish()
    }
}
