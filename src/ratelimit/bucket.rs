//! Continuous-refill token bucket.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

use super::rules::Policy;

/// Outcome of a single reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Bucket capacity (the policy's burst)
    pub limit: u32,
    /// Whole tokens left after this reservation
    pub remaining: u32,
    /// Estimated wait, from the decision instant, until capacity frees up
    pub reset_after: Duration,
    /// Wall-clock form of `reset_after`
    pub reset_at: DateTime<Utc>,
}

impl Reservation {
    /// `reset_at` as Unix seconds.
    pub fn reset_timestamp(&self) -> i64 {
        self.reset_at.timestamp()
    }
}

/// Admission state for one client under one policy.
///
/// Tokens accumulate continuously at `capacity / refill_interval`, so an
/// empty bucket is full again after one refill interval.
#[derive(Debug, Clone)]
pub struct Bucket {
    capacity: u32,
    refill_interval: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Create a full bucket for `policy`.
    pub fn new(policy: &Policy) -> Self {
        Self::new_at(policy, Instant::now())
    }

    pub(crate) fn new_at(policy: &Policy, now: Instant) -> Self {
        Self {
            capacity: policy.burst(),
            refill_interval: policy.refill_interval(),
            tokens: f64::from(policy.burst()),
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take a
    /// token.
    pub fn reserve(&mut self) -> Reservation {
        self.reserve_at(Instant::now(), Utc::now())
    }

    pub(crate) fn reserve_at(&mut self, now: Instant, wall_now: DateTime<Utc>) -> Reservation {
        self.refill(now);

        let capacity = f64::from(self.capacity);
        let interval = self.refill_interval;

        let (allowed, remaining, reset_after) = if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let until_full = interval.mul_f64((1.0 - self.tokens / capacity).clamp(0.0, 1.0));
            (true, self.tokens.floor() as u32, until_full)
        } else {
            let until_next = interval.mul_f64(((1.0 - self.tokens) / capacity).clamp(0.0, 1.0));
            (false, 0, until_next)
        };

        let reset_at = chrono::Duration::from_std(reset_after)
            .ok()
            .and_then(|d| wall_now.checked_add_signed(d))
            .unwrap_or(wall_now);

        Reservation {
            allowed,
            limit: self.capacity,
            remaining,
            reset_after,
            reset_at,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let capacity = f64::from(self.capacity);
        let refill = capacity * (elapsed.as_secs_f64() / self.refill_interval.as_secs_f64());

        self.tokens = (self.tokens + refill).clamp(0.0, capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Whether this bucket was built with the parameters of `policy`.
    pub fn conforms_to(&self, policy: &Policy) -> bool {
        self.capacity == policy.burst() && self.refill_interval == policy.refill_interval()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Tokens currently held, as of the last reservation.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}
