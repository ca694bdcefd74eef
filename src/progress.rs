//! Shared progress counters and the callback that observes them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Minimum spacing between speed recomputations.
pub const PROGRESS_TICK: Duration = Duration::from_secs(1);

/// Point-in-time view handed to the progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub bytes_per_second: u64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.bytes_downloaded >= self.bytes_total
    }
}

/// Invoked with `(bytes_just_read, snapshot)` after every buffer write,
/// possibly from several workers at once.
pub type ProgressCallback = Arc<dyn Fn(u64, ProgressSnapshot) + Send + Sync>;

#[derive(Debug)]
struct Counters {
    downloaded: u64,
    since_tick: u64,
    total: u64,
    bytes_per_second: u64,
    last_tick: Instant,
    started: Instant,
}

/// Aggregate written by every chunk writer; one lock guards each
/// read-modify-write.
#[derive(Debug)]
pub struct ProgressCounters {
    inner: Mutex<Counters>,
}

impl ProgressCounters {
    pub fn new(total: u64) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(Counters {
                downloaded: 0,
                since_tick: 0,
                total,
                bytes_per_second: 0,
                last_tick: now,
                started: now,
            }),
        }
    }

    pub fn set_total(&self, total: u64) {
        self.inner.lock().total = total;
    }

    /// Count bytes that were already on disk before this attempt. They do not
    /// contribute to the measured speed.
    pub fn add_existing(&self, bytes: u64) -> ProgressSnapshot {
        let mut c = self.inner.lock();
        c.downloaded = c.downloaded.saturating_add(bytes);
        Self::snapshot_of(&c)
    }

    /// Count freshly transferred bytes.
    pub fn advance(&self, bytes: u64) -> ProgressSnapshot {
        let mut c = self.inner.lock();
        c.downloaded = c.downloaded.saturating_add(bytes);
        c.since_tick = c.since_tick.saturating_add(bytes);
        let elapsed = c.last_tick.elapsed();
        if elapsed >= PROGRESS_TICK {
            c.bytes_per_second = (c.since_tick as f64 / elapsed.as_secs_f64()) as u64;
            c.since_tick = 0;
            c.last_tick = Instant::now();
        }
        Self::snapshot_of(&c)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        Self::snapshot_of(&self.inner.lock())
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.lock().started.elapsed()
    }

    fn snapshot_of(c: &Counters) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_downloaded: c.downloaded,
            bytes_total: c.total,
            bytes_per_second: c.bytes_per_second,
        }
    }
}

/// Counters plus the optional observer, cloned into every worker.
#[derive(Clone)]
pub struct ProgressReporter {
    counters: Arc<ProgressCounters>,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(total: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            counters: Arc::new(ProgressCounters::new(total)),
            callback,
        }
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    pub fn set_total(&self, total: u64) {
        self.counters.set_total(total);
    }

    pub fn report_existing(&self, bytes: u64) {
        let snapshot = self.counters.add_existing(bytes);
        self.notify(bytes, snapshot);
    }

    pub fn report(&self, bytes: u64) {
        let snapshot = self.counters.advance(bytes);
        self.notify(bytes, snapshot);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.counters.snapshot()
    }

    fn notify(&self, bytes: u64, snapshot: ProgressSnapshot) {
        if let Some(cb) = &self.callback {
            cb(bytes, snapshot);
        }
    }
}
