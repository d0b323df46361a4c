//! Platform capabilities the funnel depends on.
//!
//! Browser-only facilities (wall clock, randomness, whether a window exists)
//! sit behind small traits so the trigger and submission rules can run
//! against deterministic fakes in tests.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Real clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, value: i64) {
        self.now.store(value, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Clock anchored to wall time at creation and advanced by tokio's
/// monotonic timer, so paused-time tests move it along with `sleep`.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    origin_ms: i64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_ms: Utc::now().timestamp_millis(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.origin_ms + self.origin.elapsed().as_millis() as i64
    }
}

/// Uniform random draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Thread-local RNG from `rand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_unit(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Replays a fixed sequence of draws, cycling when exhausted.
#[derive(Debug)]
pub struct FixedRandom {
    values: Vec<f64>,
    cursor: AtomicU64,
}

impl FixedRandom {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            cursor: AtomicU64::new(0),
        }
    }
}

impl RandomSource for FixedRandom {
    fn next_unit(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) as usize % self.values.len();
        self.values[idx]
    }
}

/// Where the funnel code is executing.
///
/// On the server there is no document or window: listeners and storage
/// writes short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderTarget {
    #[default]
    Browser,
    Server,
}

impl RenderTarget {
    pub fn is_browser(self) -> bool {
        matches!(self, RenderTarget::Browser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1_500);
        assert_eq!(clock.now().timestamp_millis(), 1_500);
    }

    #[test]
    fn test_fixed_random_cycles() {
        let rng = FixedRandom::new(vec![0.1, 0.9]);
        assert_eq!(rng.next_unit(), 0.1);
        assert_eq!(rng.next_unit(), 0.9);
        assert_eq!(rng.next_unit(), 0.1);
    }

    #[test]
    fn test_thread_random_in_range() {
        for _ in 0..100 {
            let v = ThreadRandom.next_unit();
            assert!((0.0..1.0).contains(&v));
        }
    }
}
