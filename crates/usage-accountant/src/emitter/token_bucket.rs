//! Token bucket rate gate
//!
//! Refilled lazily from elapsed time on every acquire; nothing ticks in the
//! background. Uses tokio's clock so paused-time tests see virtual time.
//!
//! The bucket holds at most one token, so any half-open one-second window
//! admits at most `rate` acquisitions.

use std::time::Duration;
use tokio::time::Instant;

const CAPACITY: f64 = 1.0;

/// Continuous-refill token bucket
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per second
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket holding its single token
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            tokens: CAPACITY,
            last_refill: Instant::now(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(CAPACITY);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        let wait = Duration::from_secs_f64(deficit / self.rate);
        Err(wait.max(Duration::from_micros(1)))
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&mut self) {
        loop {
            match self.try_acquire_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
