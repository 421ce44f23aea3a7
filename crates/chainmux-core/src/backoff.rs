//! Exponential reconnect backoff, capped but never exhausted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling on the delay between attempts.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Multiplier applied after each consecutive failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Stateless backoff schedule — computes the delay for a given attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub config: ReconnectConfig,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th reconnect (1-based). Attempts are
    /// unbounded; the delay stops growing at `max_backoff`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exp);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Stateful wrapper used by a connection's reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    schedule: Backoff,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            schedule: Backoff::new(config),
            attempt: 0,
        }
    }

    /// Advance to the next attempt and return how long to wait first.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.schedule.delay(self.attempt)
    }

    /// Forget past failures after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
