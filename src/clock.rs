//! Wall-clock time source for the controller.
//!
//! The controller never reads the system clock directly; it is handed a
//! `Clock` at construction so tests can drive time deterministically.
//! There is no process-wide clock state.

use chrono::{DateTime, Duration, FixedOffset, Local};
use parking_lot::Mutex;

/// Monotonic wall-time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Current wall time with its UTC offset.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// System clock: local wall time with the machine's current UTC offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Settable clock for deterministic tests.
///
/// `now` returns whatever the clock was last set to; `advance` moves it
/// forward by a span.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, time: DateTime<FixedOffset>) {
        *self.now.lock() = time;
    }

    pub fn advance(&self, span: Duration) {
        let mut now = self.now.lock();
        *now += span;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_set_and_advance() {
        let start = "2024-01-01T00:00:00Z".parse().unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), start + Duration::seconds(5));

        let later = "2024-06-01T12:00:00+02:00".parse().unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }
}
