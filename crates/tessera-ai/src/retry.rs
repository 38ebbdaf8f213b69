//! Bounded, jittered exponential backoff around stream establishment.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::classify;
use crate::error::{ChatError, ProviderError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn initial_delay_ms(mut self, initial_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    pub fn max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ChatError::invalid_request(format!(
                "retry max_attempts must be within 1..={MAX_ATTEMPTS_LIMIT}, got {}",
                self.max_attempts
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ChatError::invalid_request(format!(
                "retry max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(ChatError::invalid_request(format!(
                "retry backoff_multiplier must be > 1, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ChatError::invalid_request(format!(
                "retry jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Un-jittered delay after the given 1-based failed attempt.
    pub fn base_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        raw.clamp(0.0, self.max_delay_ms as f64)
    }

    /// Delay with `unit` in `[0, 1)` mapped onto `[1 - jitter, 1 + jitter]`.
    pub fn delay_with_sample(&self, attempt: u32, unit: f64) -> Duration {
        let jitter = (1.0 - self.jitter_factor + unit * 2.0 * self.jitter_factor).max(0.0);
        let nanos = (self.base_delay_ms(attempt) * jitter * 1_000_000.0).round();
        Duration::from_nanos(nanos as u64)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, jitter_sample())
    }
}

/// Uniform sample in `[0, 1)`.
fn jitter_sample() -> f64 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
}

/// Value produced by [`RetryExecutor::run`] with the number of attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Result<Self, ChatError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. The closure receives the 1-based attempt.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<Retried<T>, ChatError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    debug!(label, attempt, "stream established");
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let classified = classify(error);
                    if !classified.retryable || attempt >= self.policy.max_attempts {
                        warn!(
                            label,
                            attempt,
                            category = %classified.category,
                            retryable = classified.retryable,
                            "giving up on stream establishment: {}",
                            classified.message
                        );
                        return Err(classified.with_attempts(attempt));
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        category = %classified.category,
                        "retrying stream establishment: {}",
                        classified.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChatErrorCode, ErrorCategory};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited() -> ProviderError {
        ProviderError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
        }
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 1_000);
        assert_eq!(policy.max_delay_ms, 10_000);
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert_eq!(policy.jitter_factor, 0.1);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        assert!(RetryPolicy::default().max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default().max_attempts(11).validate().is_err());
        assert!(RetryPolicy::default()
            .initial_delay_ms(5_000)
            .max_delay_ms(1_000)
            .validate()
            .is_err());
        assert!(RetryPolicy::default().backoff_multiplier(1.0).validate().is_err());
        assert!(RetryPolicy::default().jitter_factor(1.5).validate().is_err());
        let error = RetryPolicy::default()
            .jitter_factor(-0.1)
            .validate()
            .expect_err("negative jitter");
        assert_eq!(error.code, ChatErrorCode::InvalidRequest);
        assert_eq!(error.category, ErrorCategory::Client);
    }

    #[test]
    fn delay_before_attempt_k_stays_within_jitter_band() {
        let policy = RetryPolicy::default();
        for k in 2..=10u32 {
            let nominal = (1_000.0 * 2f64.powi(k as i32 - 2)).min(10_000.0);
            for _ in 0..50 {
                let delay_ms = policy.delay_for_attempt(k - 1).as_secs_f64() * 1_000.0;
                assert!(
                    delay_ms >= nominal * 0.9 - 1e-6 && delay_ms <= nominal * 1.1 + 1e-6,
                    "attempt {k}: {delay_ms} outside band around {nominal}"
                );
            }
        }
    }

    #[test]
    fn delay_sample_edges_map_to_band_edges() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_with_sample(1, 0.0), Duration::from_millis(900));
        assert_eq!(policy.delay_with_sample(1, 0.5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_with_sample(5, 0.5), Duration::from_millis(10_000));
    }

    #[test]
    fn full_jitter_never_goes_negative() {
        let policy = RetryPolicy::default().jitter_factor(1.0);
        assert_eq!(policy.delay_with_sample(1, 0.0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limit_until_third_attempt_succeeds() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::default()).expect("valid policy");
        let started = tokio::time::Instant::now();

        let result = executor
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(rate_limited())
                    } else {
                        Ok("stream")
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(result.value, "stream");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = started.elapsed().as_millis();
        assert!((2_699..=3_305).contains(&waited), "waited {waited}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::default()).expect("valid policy");

        let error = executor
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(ProviderError::Http {
                        status: 401,
                        message: "bad key".to_string(),
                    })
                }
            })
            .await
            .expect_err("authentication is not retried");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.category, ErrorCategory::Authentication);
        assert_eq!(error.attempts, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_with_attempt_count() {
        let calls = AtomicU32::new(0);
        let executor =
            RetryExecutor::new(RetryPolicy::default().max_attempts(2)).expect("valid policy");

        let error = executor
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::Transport("read ECONNRESET".to_string())) }
            })
            .await
            .expect_err("budget exhausted");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(error.category, ErrorCategory::Network);
        assert_eq!(error.attempts, Some(2));
    }
}
