//! Reconnection policy and per-send resume state.
//!
//! Retry delays grow as `base · 2^(attempt-1)`, capped at `max_delay`, and
//! then stretched by a random 10–30 % so that clients dropped by the same
//! outage do not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed per send before the failure is surfaced.
    pub max_retries: u32,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(8_000),
            max_retries: 5,
            jitter_min: 0.10,
            jitter_max: 0.30,
        }
    }
}

impl ReconnectConfig {
    /// Tight delays for tests.
    pub fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            max_retries: 3,
            ..Self::default()
        }
    }

    /// Delay before `attempt` (1-based) with the given jitter fraction.
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        capped + capped.mul_f64(jitter.max(0.0))
    }

    /// Delay before `attempt` with a freshly drawn jitter fraction.
    pub fn jittered_backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter_max > self.jitter_min {
            rng.gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        self.backoff(attempt, jitter)
    }
}

/// What to do after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Resume bookkeeping for one logical send.
///
/// Created fresh for every send and dropped with it, so a new prompt never
/// inherits the retry budget or resume point of the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    last_sequence: Option<u64>,
    retry_count: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Note a processed sequence. The resume point never moves backwards.
    pub fn record_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(self.last_sequence.map_or(sequence, |s| s.max(sequence)));
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Resume point to send on the next connect; only reconnects carry one.
    pub fn resume_after(&self) -> Option<u64> {
        if self.retry_count > 0 {
            self.last_sequence
        } else {
            None
        }
    }

    /// Count a failure and decide whether another attempt is allowed.
    pub fn next_retry(&mut self, config: &ReconnectConfig) -> RetryDecision {
        self.next_retry_with(config, &mut rand::thread_rng())
    }

    pub fn next_retry_with<R: Rng + ?Sized>(
        &mut self,
        config: &ReconnectConfig,
        rng: &mut R,
    ) -> RetryDecision {
        if self.retry_count >= config.max_retries {
            return RetryDecision::GiveUp {
                attempts: self.retry_count,
            };
        }
        self.retry_count += 1;
        RetryDecision::Retry {
            attempt: self.retry_count,
            delay: config.jittered_backoff(self.retry_count, rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_is_capped_exponential() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=6).map(|a| config.backoff(a, 0.0).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
        assert_eq!(config.backoff(2, 0.25), Duration::from_millis(2_500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = ReconnectConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=5 {
            let floor = config.backoff(attempt, 0.10);
            let ceiling = config.backoff(attempt, 0.30);
            for _ in 0..50 {
                let d = config.jittered_backoff(attempt, &mut rng);
                assert!(d >= floor && d <= ceiling, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn test_retry_budget() {
        let config = ReconnectConfig::for_testing();
        let mut state = ReconnectState::new();
        let mut rng = StdRng::seed_from_u64(1);
        for expected in 1..=config.max_retries {
            match state.next_retry_with(&config, &mut rng) {
                RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            state.next_retry_with(&config, &mut rng),
            RetryDecision::GiveUp { attempts: config.max_retries }
        );
    }

    #[test]
    fn test_resume_point() {
        let mut state = ReconnectState::new();
        state.record_sequence(7);
        state.record_sequence(3);
        assert_eq!(state.last_sequence(), Some(7));
        assert_eq!(state.resume_after(), None);

        state.next_retry(&ReconnectConfig::default());
        assert_eq!(state.resume_after(), Some(7));

        state.reset();
        assert_eq!(state, ReconnectState::new());
    }
}
