//! Backoff schedule for node RPC calls.
//!
//! Which failures are worth another attempt is decided by
//! [`RpcError::is_retryable`]: an error object from the node is final, since
//! the node has already answered. A node that reports itself busy (a full
//! work queue answers 503, a proxy in front of it 429) waits longer than a
//! dropped connection.

use std::time::Duration;

use crate::error::RpcError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first request.
    pub max_retries: u32,
    /// Wait before the first retry of a transport failure; doubles per attempt.
    pub base_delay: Duration,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
    /// Multiplier on the wait while the node reports it is busy.
    pub busy_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            busy_factor: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Wait before retry number `attempt` (1-based) after `error`, or `None`
    /// when the call should fail with `error` now.
    pub fn delay_for(&self, attempt: u32, error: &RpcError) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries || !error.is_retryable() {
            return None;
        }
        let step = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let mut wait = self.config.base_delay.saturating_mul(step);
        if error.is_busy() {
            wait = wait.saturating_mul(self.config.busy_factor);
        }
        Some(wait.min(self.config.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_delay: Duration) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay,
            busy_factor: 4,
        })
    }

    fn http(status: u16) -> RpcError {
        RpcError::Http { status, body: String::new() }
    }

    #[test]
    fn transport_failures_double_until_exhausted() {
        let p = policy(Duration::from_secs(30));
        let reset = RpcError::Transport("connection reset".into());
        assert_eq!(p.delay_for(1, &reset), Some(Duration::from_millis(100)));
        assert_eq!(p.delay_for(2, &reset), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(3, &reset), Some(Duration::from_millis(400)));
        assert_eq!(p.delay_for(4, &reset), None);
    }

    #[test]
    fn busy_node_waits_longer() {
        let p = policy(Duration::from_secs(30));
        assert_eq!(p.delay_for(1, &http(503)), Some(Duration::from_millis(400)));
        assert_eq!(p.delay_for(2, &http(429)), Some(Duration::from_millis(800)));
        assert_eq!(p.delay_for(1, &http(502)), Some(Duration::from_millis(100)));
    }

    #[test]
    fn wait_is_capped() {
        let p = policy(Duration::from_millis(500));
        assert_eq!(p.delay_for(3, &http(503)), Some(Duration::from_millis(500)));
    }

    #[test]
    fn node_answers_are_final() {
        let p = policy(Duration::from_secs(30));
        let out_of_range = RpcError::Rpc { code: -8, message: "Block height out of range".into() };
        assert_eq!(p.delay_for(1, &out_of_range), None);
        assert_eq!(p.delay_for(1, &RpcError::Decode("eof".into())), None);
        assert_eq!(p.delay_for(1, &http(401)), None);
    }
}
