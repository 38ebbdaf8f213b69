use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::retry::RetryPolicy;

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: DEFAULT_TIMEOUT_MS,
            min_ms: MIN_TIMEOUT_MS,
            max_ms: MAX_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.min_ms == 0 || self.min_ms > self.max_ms {
            return Err(ChatError::invalid_request(format!(
                "timeout bounds are inconsistent: min_ms={} max_ms={}",
                self.min_ms, self.max_ms
            )));
        }
        self.check(self.default_ms).map(|_| ())
    }

    /// Resolve a per-call timeout, falling back to `default_ms`.
    pub fn resolve(&self, requested_ms: Option<u64>) -> Result<Duration, ChatError> {
        self.check(requested_ms.unwrap_or(self.default_ms))
    }

    fn check(&self, timeout_ms: u64) -> Result<Duration, ChatError> {
        if timeout_ms < self.min_ms || timeout_ms > self.max_ms {
            return Err(ChatError::invalid_request(format!(
                "timeout_ms must be within {}..={}, got {timeout_ms}",
                self.min_ms, self.max_ms
            )));
        }
        Ok(Duration::from_millis(timeout_ms))
    }
}

/// Client-wide defaults shared by every call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout: TimeoutConfig,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ChatError> {
        self.timeout.validate()?;
        self.retry.validate()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_timeout_ms(mut self, default_ms: u64) -> Self {
        self.timeout.default_ms = default_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCode;

    #[test]
    fn omitted_timeout_uses_default() {
        let timeout = TimeoutConfig::default();
        assert_eq!(timeout.resolve(None).ok(), Some(Duration::from_secs(120)));
        assert_eq!(
            timeout.resolve(Some(5_000)).ok(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn out_of_bounds_timeout_is_invalid_request() {
        let timeout = TimeoutConfig::default();
        for requested in [0, 999, 600_001] {
            let error = timeout
                .resolve(Some(requested))
                .expect_err("outside bounds");
            assert_eq!(error.code, ChatErrorCode::InvalidRequest);
            assert!(!error.retryable);
        }
        assert!(timeout.resolve(Some(1_000)).is_ok());
        assert!(timeout.resolve(Some(600_000)).is_ok());
    }

    #[test]
    fn partial_config_fills_remaining_fields_with_defaults() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "timeout": { "default_ms": 30000 },
            "retry": { "max_attempts": 5 }
        }))
        .expect("deserialize config");

        assert_eq!(config.timeout.default_ms, 30_000);
        assert_eq!(config.timeout.max_ms, MAX_TIMEOUT_MS);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        let config = ClientConfig {
            timeout: TimeoutConfig {
                default_ms: 5_000,
                min_ms: 10_000,
                max_ms: 1_000,
            },
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
