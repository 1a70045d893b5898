//! Time source and periodic scheduling.
//!
//! All monitor timers are driven through [`Scheduler`] against a [`Clock`],
//! so tests can replace wall time with [`FakeClock`] and step through ticks
//! deterministically. Callbacks are run by the caller one at a time; two
//! due tasks never execute concurrently.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: StdDuration) {
        if let Ok(mut now) = self.now.lock() {
            *now += to_chrono(by);
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

pub fn to_chrono(duration: StdDuration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(36_500))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Ticker<K> {
    key: K,
    interval: Duration,
    next_due: Option<DateTime<Utc>>,
    enabled: bool,
}

/// Fixed-interval timers keyed by `K`.
///
/// A newly added timer is due immediately; a re-enabled one waits a full
/// interval first. After firing, the
/// next deadline is `now + interval`, so a slow callback delays its own next
/// run instead of causing a burst of catch-up runs.
#[derive(Debug, Clone)]
pub struct Scheduler<K> {
    tickers: Vec<Ticker<K>>,
}

impl<K: Copy + Eq + std::fmt::Debug> Scheduler<K> {
    pub fn new() -> Self {
        Self {
            tickers: Vec::new(),
        }
    }

    pub fn add(&mut self, key: K, interval: StdDuration) {
        self.add_with_state(key, interval, true);
    }

    /// Registers a timer that stays idle until [`Scheduler::enable`] is called.
    pub fn add_disabled(&mut self, key: K, interval: StdDuration) {
        self.add_with_state(key, interval, false);
    }

    fn add_with_state(&mut self, key: K, interval: StdDuration, enabled: bool) {
        self.tickers.retain(|ticker| ticker.key != key);
        self.tickers.push(Ticker {
            key,
            interval: to_chrono(interval),
            next_due: None,
            enabled,
        });
    }

    /// Enables a timer. The first run happens one interval from `now`.
    pub fn enable(&mut self, key: K, now: DateTime<Utc>) {
        if let Some(ticker) = self.tickers.iter_mut().find(|ticker| ticker.key == key) {
            if !ticker.enabled {
                ticker.enabled = true;
                ticker.next_due = Some(now + ticker.interval);
            }
        }
    }

    pub fn disable(&mut self, key: K) {
        if let Some(ticker) = self.tickers.iter_mut().find(|ticker| ticker.key == key) {
            ticker.enabled = false;
            ticker.next_due = None;
        }
    }

    pub fn is_enabled(&self, key: K) -> bool {
        self.tickers
            .iter()
            .any(|ticker| ticker.key == key && ticker.enabled)
    }

    /// Returns the keys due at `now` in registration order and schedules
    /// their next deadline.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<K> {
        let mut due = Vec::new();
        for ticker in self.tickers.iter_mut().filter(|ticker| ticker.enabled) {
            let is_due = ticker.next_due.map(|next| now >= next).unwrap_or(true);
            if is_due {
                ticker.next_due = Some(now + ticker.interval);
                due.push(ticker.key);
            }
        }
        due
    }

    /// Time until the earliest enabled deadline, zero if something is overdue.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<StdDuration> {
        self.tickers
            .iter()
            .filter(|ticker| ticker.enabled)
            .map(|ticker| match ticker.next_due {
                Some(next) => (next - now).to_std().unwrap_or(StdDuration::ZERO),
                None => StdDuration::ZERO,
            })
            .min()
    }

    pub fn clear(&mut self) {
        self.tickers.clear();
    }
}

impl<K: Copy + Eq + std::fmt::Debug> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Task {
        Fast,
        Slow,
        Gated,
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    #[test]
    fn new_timers_fire_immediately_then_on_interval() {
        let clock = FakeClock::new(start());
        let mut scheduler = Scheduler::new();
        scheduler.add(Task::Fast, StdDuration::from_secs(5));
        scheduler.add(Task::Slow, StdDuration::from_secs(30));

        assert_eq!(scheduler.due(clock.now()), vec![Task::Fast, Task::Slow]);
        assert!(scheduler.due(clock.now()).is_empty());

        clock.advance(StdDuration::from_secs(5));
        assert_eq!(scheduler.due(clock.now()), vec![Task::Fast]);

        clock.advance(StdDuration::from_secs(25));
        assert_eq!(scheduler.due(clock.now()), vec![Task::Fast, Task::Slow]);
    }

    #[test]
    fn disabled_timer_waits_for_enable() {
        let clock = FakeClock::new(start());
        let mut scheduler = Scheduler::new();
        scheduler.add_disabled(Task::Gated, StdDuration::from_secs(300));

        assert!(scheduler.due(clock.now()).is_empty());
        assert_eq!(scheduler.until_next(clock.now()), None);

        scheduler.enable(Task::Gated, clock.now());
        assert!(scheduler.due(clock.now()).is_empty());
        assert_eq!(
            scheduler.until_next(clock.now()),
            Some(StdDuration::from_secs(300))
        );

        clock.advance(StdDuration::from_secs(300));
        assert_eq!(scheduler.due(clock.now()), vec![Task::Gated]);

        scheduler.disable(Task::Gated);
        clock.advance(StdDuration::from_secs(300));
        assert!(scheduler.due(clock.now()).is_empty());
    }

    #[test]
    fn until_next_reports_earliest_deadline() {
        let clock = FakeClock::new(start());
        let mut scheduler = Scheduler::new();
        scheduler.add(Task::Fast, StdDuration::from_secs(5));
        scheduler.add(Task::Slow, StdDuration::from_secs(30));
        assert_eq!(scheduler.until_next(clock.now()), Some(StdDuration::ZERO));

        scheduler.due(clock.now());
        clock.advance(StdDuration::from_secs(2));
        assert_eq!(
            scheduler.until_next(clock.now()),
            Some(StdDuration::from_secs(3))
        );
    }
}
