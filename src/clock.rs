//! Injectable clock
//!
//! The ordering buffer, the dedup map, and the emission throttle all read
//! "now" through a [`Clock`] handed to them at construction. Production code
//! uses [`Clock::system`]; tests use [`Clock::manual`] and advance time
//! explicitly, which makes lateness / window arithmetic deterministic.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic clock abstraction.
#[derive(Clone)]
pub struct Clock {
    inner: ClockInner,
}

#[derive(Clone)]
enum ClockInner {
    System,
    Manual(Arc<Mutex<Instant>>),
}

impl Clock {
    /// Real monotonic clock.
    pub fn system() -> Self {
        Self {
            inner: ClockInner::System,
        }
    }

    /// Manually-driven clock for tests. Starts at the returned handle's
    /// creation instant; advance it with [`ManualClock::advance`].
    pub fn manual() -> (Self, ManualClock) {
        let now = Arc::new(Mutex::new(Instant::now()));
        let clock = Self {
            inner: ClockInner::Manual(Arc::clone(&now)),
        };
        (clock, ManualClock { now })
    }

    /// Current instant.
    pub fn now(&self) -> Instant {
        match &self.inner {
            ClockInner::System => Instant::now(),
            ClockInner::Manual(now) => *now.lock().expect("clock mutex poisoned"),
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            ClockInner::System => write!(f, "Clock::System"),
            ClockInner::Manual(_) => write!(f, "Clock::Manual"),
        }
    }
}

/// Driver handle for a manual [`Clock`].
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotone() {
        let clock = Clock::system();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advance() {
        let (clock, driver) = Clock::manual();
        let start = clock.now();

        driver.advance(Duration::from_millis(150));
        assert_eq!(clock.now() - start, Duration::from_millis(150));

        driver.advance(Duration::from_millis(50));
        assert_eq!(clock.now() - start, Duration::from_millis(200));
    }

    #[test]
    fn test_manual_clock_shared_view() {
        let (clock, driver) = Clock::manual();
        let clone = clock.clone();
        driver.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), clone.now());
    }
}
