//! Runtime settings for the ingest pipeline.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Ingest runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Telemetry feed consumed by `fw run`.
    pub websocket_url: Option<String>,

    /// Capacity of each plate worker's inbound channel.
    pub channel_capacity: usize,

    /// Writes a worker keeps queued during an outage before dropping the
    /// oldest.
    pub max_pending_writes: usize,

    /// Upper bound for a single store call.
    pub write_timeout_ms: u64,

    /// How long shutdown waits for workers to drain.
    pub shutdown_timeout_ms: u64,

    /// Capacity of the write-failure channel.
    pub failure_channel_capacity: usize,

    /// Backoff for store writes.
    pub retry: RetryPolicy,

    /// Backoff between WebSocket reconnects. `max_attempts` is ignored;
    /// reconnects continue until shutdown.
    pub reconnect: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            websocket_url: None,
            channel_capacity: 1024,
            max_pending_writes: 10_000,
            write_timeout_ms: 5_000,
            shutdown_timeout_ms: 10_000,
            failure_channel_capacity: 256,
            retry: RetryPolicy::default(),
            reconnect: RetryPolicy {
                initial_delay_ms: 500,
                max_delay_ms: 30_000,
                ..RetryPolicy::default()
            },
        }
    }
}

impl IngestConfig {
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,

    /// Cap on any single delay.
    pub max_delay_ms: u64,

    /// Multiplier applied after each retry.
    pub backoff_factor: f64,

    /// Random jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,

    /// Attempts per write, including the first.
    pub max_attempts: u32,

    /// Pause after a write exhausts its attempts before the queue is tried
    /// again.
    pub cooldown_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 5,
            cooldown_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        reason = "delays are capped at max_delay_ms and the exponent at 31"
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31) as i32;
        let base_ms = (self.initial_delay_ms as f64) * self.backoff_factor.max(1.0).powi(exp);
        let base_ms = base_ms.min(self.max_delay_ms as f64);

        let jitter_percent = self.jitter_percent.clamp(0.0, 1.0);
        let jitter = if jitter_percent > 0.0 && base_ms > 0.0 {
            let range = base_ms * jitter_percent;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            jitter_percent: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(2_000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(180));
            assert!(delay <= Duration::from_millis(220));
        }
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: IngestConfig =
            serde_json::from_str(r#"{"retry": {"max_attempts": 2}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.cooldown_ms, 5_000);
        assert_eq!(config.channel_capacity, 1024);
    }
}
