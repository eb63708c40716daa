//! Sliding-window throttle: at most `limit` acquisitions per `window`.
//!
//! Callers beyond the budget queue (wait) rather than fail. The limiter keeps
//! the reserved slots explicitly, so the next allowed time is always
//! observable via [`RateLimiter::next_allowed`].

use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    /// Start times of the reservations still inside the window, ascending.
    slots: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            window,
            slots: VecDeque::with_capacity(limit as usize),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Earliest instant at which a new acquisition would not wait.
    pub fn next_allowed(&self, now: Instant) -> Instant {
        if (self.slots.len() as u32) < self.limit {
            return now;
        }
        // The slot that has to age out is `limit` places from the back.
        let idx = self.slots.len() - self.limit as usize;
        (self.slots[idx] + self.window).max(now)
    }

    /// Reserve one slot and return how long the caller must wait before using it.
    pub fn reserve_at(&mut self, now: Instant) -> Duration {
        while let Some(&front) = self.slots.front() {
            if front + self.window <= now {
                self.slots.pop_front();
            } else {
                break;
            }
        }

        let at = self.next_allowed(now);
        self.slots.push_back(at);
        at.saturating_duration_since(now)
    }

    /// Wait until a slot is available.
    pub async fn acquire(&mut self) -> Duration {
        let wait = self.reserve_at(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }
}
