//! Time abstraction for the cut timer.
//!
//! The generator never reads the system clock directly; it goes through
//! [`Clock`] so that tests can drive cuts deterministically with
//! [`ManualClock`] while production uses [`SystemClock`].

use std::{
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Granularity of cancellation checks while waiting.
const WAIT_CHUNK: Duration = Duration::from_millis(10);

/// A source of milliseconds-since-epoch time with cancellable waiting.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_millis(&self) -> i64;

    /// Block until the clock reaches `target_ms` or `cancel` is raised,
    /// whichever comes first. Returns the clock value on return.
    fn wait_until(&self, target_ms: i64, cancel: &AtomicBool) -> i64;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn wait_until(&self, target_ms: i64, cancel: &AtomicBool) -> i64 {
        loop {
            let now = self.now_millis();
            if now >= target_ms || cancel.load(Ordering::Acquire) {
                return now;
            }
            let remaining = Duration::from_millis((target_ms - now) as u64);
            thread::sleep(remaining.min(WAIT_CHUNK));
        }
    }
}

/// A clock that only moves when told to.
///
/// `advance`/`set` wake any thread blocked in [`Clock::wait_until`],
/// which makes cut timing fully deterministic in tests.
pub struct ManualClock {
    time: Mutex<i64>,
    moved: Condvar,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            time: Mutex::new(start_ms),
            moved: Condvar::new(),
        }
    }

    /// Move the clock forward by `delta_ms`, returning the new time.
    pub fn advance(&self, delta_ms: i64) -> i64 {
        let mut time = self.lock_time();
        *time += delta_ms;
        let now = *time;
        drop(time);
        self.moved.notify_all();
        now
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, time_ms: i64) {
        let mut time = self.lock_time();
        *time = time_ms;
        drop(time);
        self.moved.notify_all();
    }

    fn lock_time(&self) -> std::sync::MutexGuard<'_, i64> {
        match self.time.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        *self.lock_time()
    }

    fn wait_until(&self, target_ms: i64, cancel: &AtomicBool) -> i64 {
        let mut time = self.lock_time();
        loop {
            if *time >= target_ms || cancel.load(Ordering::Acquire) {
                return *time;
            }
            // Bounded wait so a raised cancel flag is noticed even
            // without a clock movement.
            time = match self.moved.wait_timeout(time, WAIT_CHUNK) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
