//! Reconnect backoff.
//!
//! Attempt `n` (1-based) waits `min(initial * multiplier^(n-1), max)`,
//! scaled by a jitter factor drawn uniformly from `[0.5, 1.5]`:
//!
//! ```text
//! attempt   1      2      3      4      5  ...
//! base    500ms   1s     2s     4s     8s  ... 30s cap
//! delay   base × U(0.5, 1.5)
//! ```
//!
//! The counter goes back to zero only after the stream has been streaming
//! for a full reset window; a single good event is not enough.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

pub use crate::config::BackoffConfig;

/// Base delay for `attempt`, ignoring jitter. Attempt 0 is treated as 1.
pub fn base_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let max = config.max_delay();
    let scaled = config.initial_delay().as_secs_f64() * config.multiplier.powi(exponent);
    if !scaled.is_finite() || scaled >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(scaled).min(max)
}

/// Randomizes a base delay.
pub trait Jitter: Send + Sync + fmt::Debug {
    fn apply(&self, base: Duration) -> Duration;
}

/// Uniform factor in `[0.5, 1.5]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformJitter;

impl Jitter for UniformJitter {
    fn apply(&self, base: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        base.mul_f64(factor)
    }
}

/// Uses the base delay unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn apply(&self, base: Duration) -> Duration {
        base
    }
}

/// One scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    pub attempt: u32,
    pub base: Duration,
    pub delay: Duration,
}

/// Attempt counter for one stream.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    jitter: Arc<dyn Jitter>,
    attempt: u32,
    streaming_since: Option<Instant>,
}

impl Backoff {
    pub fn new(config: BackoffConfig, jitter: Arc<dyn Jitter>) -> Self {
        Self {
            config,
            jitter,
            attempt: 0,
            streaming_since: None,
        }
    }

    /// The stream reached `Streaming` at `now`.
    pub fn on_streaming(&mut self, now: Instant) {
        self.streaming_since = Some(now);
    }

    /// Schedule the next attempt after a failure at `now`, or `None` once
    /// the configured maximum is exceeded.
    pub fn next_delay(&mut self, now: Instant) -> Option<BackoffStep> {
        if let Some(since) = self.streaming_since.take() {
            if now.saturating_duration_since(since) >= self.config.reset_window() {
                self.attempt = 0;
            }
        }

        let attempt = self.attempt.saturating_add(1);
        if self.config.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        self.attempt = attempt;

        let base = base_delay(&self.config, attempt);
        Some(BackoffStep {
            attempt,
            base,
            delay: self.jitter.apply(base),
        })
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.streaming_since = None;
    }

    /// Attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
