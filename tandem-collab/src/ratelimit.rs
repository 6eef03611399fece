//! Sliding-window limiter for inbound messages on one connection.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::RateLimit;

pub struct RateLimiter {
    limit: RateLimit,
    /// Arrival times of accepted messages inside the current window
    recent: VecDeque<Instant>,
    rejected: u64,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            recent: VecDeque::with_capacity(limit.max_messages as usize),
            rejected: 0,
        }
    }

    /// Record a message arriving now. Returns false if it is over budget.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= self.limit.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.limit.max_messages as usize {
            self.rejected += 1;
            return false;
        }
        self.recent.push_back(now);
        true
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}
