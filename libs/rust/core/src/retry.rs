//! Bounded retry with exponential backoff and jitter, applied by the
//! session orchestrator to failed rounds.

use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.0 - 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = (self.base_delay_ms as f64) * 2f64.powi(attempt as i32);
        let mut delay_ms = exp.min(self.max_delay_ms as f64) as i64;
        if self.jitter > 0.0 {
            let jitter_ms = (delay_ms as f64 * self.jitter) as i64;
            if jitter_ms > 0 {
                let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
                delay_ms = (delay_ms + offset).max(0);
            }
        }
        Duration::from_millis(delay_ms as u64)
    }
}
