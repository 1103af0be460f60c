//! Backoff after destination load failures.

use std::time::{Duration, Instant};

/// Default shortest fallback interval.
pub const MIN_FALLBACK: Duration = Duration::from_secs(5);

/// Tracks the current fallback interval.
///
/// The first failure waits the floor ([`MIN_FALLBACK`] unless configured).
/// Each later failure waits twice
/// the wall-clock time since the previous one, clamped to the floor and the
/// configured ceiling. A successful load clears everything.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    floor: Duration,
    ceiling: Duration,
    current: Option<Duration>,
    last_error_at: Option<Instant>,
}

impl FallbackPolicy {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            floor: MIN_FALLBACK.min(ceiling),
            ceiling,
            current: None,
            last_error_at: None,
        }
    }

    pub fn with_floor(mut self, floor: Duration) -> Self {
        self.floor = floor.min(self.ceiling);
        self
    }

    pub fn current(&self) -> Option<Duration> {
        self.current
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Record a failure at `now` and return the interval to wait.
    pub fn on_load_failure(&mut self, now: Instant) -> Duration {
        let next = match self.last_error_at {
            None => self.floor,
            Some(last) => now
                .saturating_duration_since(last)
                .saturating_mul(2)
                .min(self.ceiling)
                .max(self.floor),
        };
        self.current = Some(next);
        self.last_error_at = Some(now);
        next
    }

    pub fn on_load_success(&mut self) {
        self.current = None;
        self.last_error_at = None;
    }
}
