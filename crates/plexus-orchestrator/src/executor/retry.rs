use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff between attempts of a failed task. The number of attempts is
/// bounded per task by `Task::max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, doubled for each subsequent one.
    pub backoff_base_ms: u64,
    /// Upper bound on a single delay.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately.
    pub fn immediate() -> Self {
        Self {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(compute_backoff(self, retry))
    }
}

fn compute_backoff(policy: &RetryPolicy, retry: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(retry));
    delay.min(policy.backoff_max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(63), Duration::from_millis(1_000));
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RetryPolicy::immediate().backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
    }
}
