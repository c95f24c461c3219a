use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff for the reconnect loop
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    current_delay_ms: u64,
}

/// One scheduled reconnect attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based
    pub number: u32,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay_ms = config.base_delay_ms;
        Backoff {
            config,
            attempts: 0,
            current_delay_ms,
        }
    }

    /// Schedule the next attempt, or `None` once `max_attempts` have been used.
    pub fn next_attempt(&mut self) -> Option<Attempt> {
        if !self.can_retry() {
            return None;
        }

        self.attempts += 1;
        let delay_ms = self.current_delay_ms;

        // delay = min(delay × multiplier, cap)
        let grown = (self.current_delay_ms as f64 * self.config.multiplier).round();
        self.current_delay_ms = if grown.is_finite() {
            (grown as u64).min(self.config.max_delay_ms)
        } else {
            self.config.max_delay_ms
        };

        Some(Attempt {
            number: self.attempts,
            max_attempts: self.config.max_attempts,
            delay: Duration::from_millis(delay_ms),
        })
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.config.max_attempts
    }

    /// Back to the base delay with a fresh attempt budget
    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.current_delay_ms = self.config.base_delay_ms;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn status(&self) -> String {
        if self.attempts == 0 {
            return "OK".to_string();
        }
        if !self.can_retry() {
            return format!("MAX_ATTEMPTS_EXCEEDED ({})", self.config.max_attempts);
        }
        format!(
            "RETRYING (attempt {}/{}, next delay {} ms)",
            self.attempts, self.config.max_attempts, self.current_delay_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delay_sequence() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_attempt())
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert!(backoff.next_attempt().is_none());
        assert!(backoff.status().starts_with("MAX_ATTEMPTS_EXCEEDED"));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = Backoff::new(BackoffConfig {
            base_delay_ms: 1_000,
            multiplier: 3.0,
            max_delay_ms: 5_000,
            max_attempts: 4,
        });
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_attempt())
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 3_000, 5_000, 5_000]);
    }

    #[test]
    fn test_success_resets() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_attempt();
        let second = backoff.next_attempt().unwrap();
        assert_eq!(second.number, 2);
        assert_eq!(second.max_attempts, 5);

        backoff.record_success();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.status(), "OK");
        let first = backoff.next_attempt().unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(first.delay, Duration::from_millis(1_000));
    }
}
