//! Monotonic time and cancellable timers.
//!
//! Everything is built on `tokio::time`, so a paused test runtime drives the
//! whole engine deterministically.

use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Cancelled,
}

impl Wake {
    pub fn is_cancelled(&self) -> bool {
        *self == Wake::Cancelled
    }
}

pub fn now() -> Instant {
    Instant::now()
}

/// One-shot wait that resolves early when `cancel` fires.
pub async fn after(duration: Duration, cancel: &CancellationToken) -> Wake {
    until(Instant::now() + duration, cancel).await
}

pub async fn until(deadline: Instant, cancel: &CancellationToken) -> Wake {
    if cancel.is_cancelled() {
        return Wake::Cancelled;
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Wake::Cancelled,
        _ = sleep_until(deadline) => Wake::Elapsed,
    }
}

pub fn every(interval: Duration) -> Ticker {
    Ticker::starting_at(Instant::now(), interval)
}

/// Periodic ticks anchored to a fixed origin.
///
/// Tick `n` is due at `origin + n * interval`, no matter when tick `n - 1`
/// actually fired, so a late wakeup never pushes later ticks back. Ticks
/// that are already overdue fire immediately one after another.
#[derive(Debug)]
pub struct Ticker {
    origin: Instant,
    interval: Duration,
    fired: u64,
}

impl Ticker {
    pub fn starting_at(origin: Instant, interval: Duration) -> Self {
        Self {
            origin,
            interval,
            fired: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Instant at which the next tick is due.
    pub fn next_due(&self) -> Instant {
        let offset = self.interval.as_nanos() * self.fired as u128;
        self.origin + Duration::from_nanos(offset.min(u64::MAX as u128) as u64)
    }

    /// Number of ticks due strictly before `at`, fired or not.
    pub fn due_before(&self, at: Instant) -> u64 {
        let span = at.saturating_duration_since(self.origin).as_nanos();
        let step = self.interval.as_nanos().max(1);
        span.div_ceil(step).min(u64::MAX as u128) as u64
    }

    /// Wait for the next tick. Returns the tick's scheduled instant, or
    /// `None` once `cancel` fires; a cancelled ticker never fires again.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Option<Instant> {
        let due = self.next_due();
        match until(due, cancel).await {
            Wake::Elapsed => {
                self.fired += 1;
                Some(due)
            }
            Wake::Cancelled => None,
        }
    }
}
