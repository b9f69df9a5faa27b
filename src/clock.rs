use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Time source for everything that throttles, times out or expires.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let step = Duration::from_std(by).unwrap_or(Duration::zero());
        match self.now.lock() {
            Ok(mut now) => *now += step,
            Err(poisoned) => *poisoned.into_inner() += step,
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(std::time::Duration::from_millis(ms.max(0) as u64));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Elapsed time between two instants, zero when `later` is not later.
pub fn elapsed(since: DateTime<Utc>, later: DateTime<Utc>) -> std::time::Duration {
    (later - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance_ms(1500);
        assert_eq!(elapsed(start, clock.now()), std::time::Duration::from_millis(1500));
    }

    #[test]
    fn test_elapsed_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed(now, now - Duration::seconds(5)), std::time::Duration::ZERO);
    }
}
