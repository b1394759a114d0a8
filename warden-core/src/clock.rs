//! Monotonic + wallclock capability.
//!
//! Deadlines inside the services are monotonic durations measured from the
//! clock's epoch, so the manual clock can drive lifetime and cooldown logic
//! deterministically in tests.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Time capability.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock's epoch. Never goes backwards.
    fn monotonic(&self) -> Duration;

    /// Wallclock timestamp for wire records.
    fn wall(&self) -> DateTime<Utc>;
}

/// Process clock backed by `std::time::Instant`.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-cranked clock for deterministic tests.
pub struct ManualClock {
    state: Mutex<(Duration, DateTime<Utc>)>,
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("monotonic", &state.0)
            .field("wall", &state.1)
            .finish()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((Duration::ZERO, Utc::now())),
        }
    }

    /// Advance both monotonic and wall time.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.0 += by;
        state.1 += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (Duration, DateTime<Utc>)> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.lock().0
    }

    fn wall(&self) -> DateTime<Utc> {
        self.lock().1
    }
}
