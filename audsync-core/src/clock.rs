//! Clock offset estimation
//!
//! Every position projection uses a server-relative "now". The estimator
//! keeps (server time - local time) from two sources: a dedicated offset
//! signal published by the store, averaged over a small window, or failing
//! that, the timestamps of authoritative writes as they arrive.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::OFFSET_SAMPLE_WINDOW;

/// Source of local wall-clock time in milliseconds since UNIX epoch
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> u64;
}

pub type SharedClock = Arc<dyn Clock>;

/// The machine's wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A wall clock shifted by a fixed amount, for simulating skewed devices
#[derive(Debug, Clone, Copy)]
pub struct SkewedClock {
    skew_ms: i64,
}

impl SkewedClock {
    pub fn new(skew_ms: i64) -> Self {
        Self { skew_ms }
    }
}

impl Clock for SkewedClock {
    fn now_ms(&self) -> u64 {
        (SystemClock.now_ms() as i64 + self.skew_ms).max(0) as u64
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Estimates the offset between the store's authoritative clock and ours
#[derive(Debug)]
pub struct ClockOffsetEstimator {
    local: SharedClock,
    /// Recent samples from the dedicated offset signal
    samples: VecDeque<i64>,
    window: usize,
    /// Cached average of `samples`
    signal_offset_ms: Option<i64>,
    /// Best lower bound derived from authoritative write timestamps
    write_bound_ms: Option<i64>,
}

impl ClockOffsetEstimator {
    pub fn new(local: SharedClock) -> Self {
        Self::with_window(local, OFFSET_SAMPLE_WINDOW)
    }

    pub fn with_window(local: SharedClock, window: usize) -> Self {
        let window = window.max(1);
        Self {
            local,
            samples: VecDeque::with_capacity(window),
            window,
            signal_offset_ms: None,
            write_bound_ms: None,
        }
    }

    /// Record a value from the store's dedicated offset signal
    pub fn record_sample(&mut self, offset_ms: i64) {
        if self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(offset_ms);

        let sum: i64 = self.samples.iter().sum();
        let avg = sum / self.samples.len() as i64;
        self.signal_offset_ms = Some(avg);

        tracing::debug!(
            "Clock offset sample={}ms, avg={}ms over {} samples",
            offset_ms,
            avg,
            self.samples.len()
        );
    }

    /// Fold in the timestamp of an authoritative write we just received.
    ///
    /// A write can't be stamped later than the server's current time, so
    /// `timestamp - local_now` is a lower bound on the true offset; the
    /// estimate keeps the tightest bound seen.
    pub fn observe_write(&mut self, server_timestamp_ms: u64) {
        let bound = server_timestamp_ms as i64 - self.local.now_ms() as i64;
        let improved = self.write_bound_ms.map_or(true, |current| bound > current);
        if improved {
            self.write_bound_ms = Some(bound);
        }
    }

    /// Whether a dedicated offset signal has produced any samples
    pub fn has_signal(&self) -> bool {
        self.signal_offset_ms.is_some()
    }

    /// Current offset estimate; zero when nothing is known yet
    pub fn offset_ms(&self) -> i64 {
        self.signal_offset_ms.or(self.write_bound_ms).unwrap_or(0)
    }

    /// Local time adjusted to the authoritative clock
    pub fn server_now_ms(&self) -> u64 {
        (self.local.now_ms() as i64 + self.offset_ms()).max(0) as u64
    }

    pub fn local_now_ms(&self) -> u64 {
        self.local.now_ms()
    }

    /// Forget all samples (when leaving a room)
    pub fn clear(&mut self) {
        self.samples.clear();
        self.signal_offset_ms = None;
        self.write_bound_ms = None;
    }
}

/// Thread-safe wrapper for ClockOffsetEstimator
pub type SharedClockOffset = Arc<RwLock<ClockOffsetEstimator>>;

/// Create a new shared offset estimator over the given local clock
pub fn new_shared_offset(local: SharedClock, window: usize) -> SharedClockOffset {
    Arc::new(RwLock::new(ClockOffsetEstimator::with_window(local, window)))
}
