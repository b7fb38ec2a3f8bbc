//! Clocks
//!
//! The waiter reads time only through [`Clock`], so scripted sources and
//! tests can drive it with a [`ManualClock`] instead of the wall clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Furthest a [`ManualClock`] moves past its origin
pub const MANUAL_CLOCK_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// The instant this clock started at
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }

    /// Move the clock forward, stopping at [`MANUAL_CLOCK_HORIZON`]
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(by).min(MANUAL_CLOCK_HORIZON);
    }

    /// Move the clock forward to `instant`; earlier instants are ignored
    pub fn advance_to(&self, instant: Instant) {
        let target = instant
            .saturating_duration_since(self.origin)
            .min(MANUAL_CLOCK_HORIZON);
        let mut offset = self.offset.lock();
        if target > *offset {
            *offset = target;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
