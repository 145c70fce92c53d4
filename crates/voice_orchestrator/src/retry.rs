//! Retry logic with exponential backoff
//!
//! Retries a single provider on transient failures. Retries never cross
//! providers: switching is the fallback executor's business.
//!
//! # Example
//!
//! ```rust,ignore
//! use voice_orchestrator::retry::{RetryConfig, with_retry};
//!
//! let retried = with_retry(&RetryConfig::default(), || executor.synthesize("Hallo", &options)).await;
//! println!("{} dispatch(es)", retried.attempts);
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use voice_provider::ProviderError;

use crate::error::ConfigError;

/// Upper bound for `max_retries`
const MAX_RETRIES_LIMIT: u32 = 10;

/// Per-provider retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial try (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds (default: 100ms)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Growth factor between consecutive pauses (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum delay between retries in milliseconds (default: 5000ms)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Multiplicative jitter, 0.0 to 1.0 (default: 0.1 = ±10%)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_backoff_ms() -> u64 {
    100
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

const fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Create a retry configuration with custom parameters
    #[must_use]
    pub const fn new(max_retries: u32, backoff_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            backoff_multiplier,
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }

    /// A policy that never retries
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, 0, 1.0)
    }

    /// Same policy with deterministic pauses
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Check ranges
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid(
                format!("{prefix}.max_retries"),
                format!("must be at most {MAX_RETRIES_LIMIT}"),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("{prefix}.backoff_multiplier"),
                "must be a finite number >= 1.0",
            ));
        }
        if self.max_backoff_ms < self.backoff_ms {
            return Err(ConfigError::invalid(
                format!("{prefix}.max_backoff_ms"),
                "must not be smaller than backoff_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                format!("{prefix}.jitter_factor"),
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    /// Pause before retry number `attempt`, counting from zero
    ///
    /// `backoff_ms * backoff_multiplier^attempt`, capped at `max_backoff_ms`,
    /// then moved by up to `jitter_factor` of itself in either direction.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = (self.backoff_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let pause = exponential.min(self.max_backoff_ms as f64);
        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(pause as u64);
        }
        let spread = pause * self.jitter_factor;
        let shifted = pause + rand::rng().random_range(-spread..=spread);
        Duration::from_millis(shifted.max(0.0) as u64)
    }
}

/// What a retried call produced
#[derive(Debug)]
pub struct Retried<T> {
    /// Final outcome of the last dispatch
    pub result: Result<T, ProviderError>,
    /// Dispatches made, counting the first one
    pub attempts: u32,
    /// Wall time from the first dispatch until the outcome, backoff included
    pub elapsed: Duration,
}

/// Dispatch `call` until it succeeds, fails permanently or the budget runs out
///
/// Only [`ProviderError::is_transient`] failures are retried. The caller
/// bounds the whole sequence with its own deadline.
#[allow(clippy::cast_possible_truncation)]
pub async fn with_retry<F, Fut, T>(policy: &RetryConfig, mut call: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let began = Instant::now();
    let mut attempts = 0u32;

    let result = loop {
        attempts += 1;
        let error = match call().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "Provider call recovered on retry");
                }
                break Ok(value);
            },
            Err(error) => error,
        };

        if !error.is_transient() {
            debug!(attempts, code = %error.code(), "Not retrying provider error");
            break Err(error);
        }
        let retries_used = attempts - 1;
        if retries_used >= policy.max_retries {
            warn!(attempts, code = %error.code(), error = %error, "Retry budget spent");
            break Err(error);
        }

        let pause = policy.delay_for_attempt(retries_used);
        debug!(
            attempts,
            pause_ms = pause.as_millis() as u64,
            code = %error.code(),
            "Transient provider error, backing off"
        );
        tokio::time::sleep(pause).await;
    };

    Retried {
        result,
        attempts,
        elapsed: began.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn config_default_values() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.backoff_ms, 100);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_backoff_ms, 5_000);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let config = RetryConfig::default().without_jitter();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig {
            max_backoff_ms: 1_000,
            ..RetryConfig::default().without_jitter()
        };
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default();
        for _ in 0..200 {
            let delay = config.delay_for_attempt(1).as_millis();
            assert!((180..=220).contains(&delay), "delay {delay}ms out of range");
        }
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RetryConfig::default().validate("retry").is_ok());

        let config = RetryConfig {
            jitter_factor: 1.5,
            ..RetryConfig::default()
        };
        assert!(config.validate("retry").is_err());

        let config = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(config.validate("retry").is_err());

        let config = RetryConfig {
            max_retries: 50,
            ..RetryConfig::default()
        };
        assert!(config.validate("retry").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let retried = with_retry(&RetryConfig::default(), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::ConnectionFailed("refused".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(retried.result, Ok("done"));
        assert_eq!(retried.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_the_number_of_dispatches() {
        let retried: Retried<()> =
            with_retry(&RetryConfig::default(), || async { Err(ProviderError::Timeout(50)) }).await;

        assert_eq!(retried.attempts, 3);
        assert_eq!(retried.result, Err(ProviderError::Timeout(50)));
    }

    #[tokio::test]
    async fn provider_faults_are_given_up_immediately() {
        let retried: Retried<()> = with_retry(&RetryConfig::default(), || async {
            Err(ProviderError::SynthesisFailed("vocoder".to_string()))
        })
        .await;

        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn invalid_input_is_given_up_immediately() {
        let retried: Retried<()> = with_retry(&RetryConfig::default(), || async {
            Err(ProviderError::InvalidInput("empty".to_string()))
        })
        .await;

        assert_eq!(retried.attempts, 1);
        assert!(matches!(retried.result, Err(ProviderError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_time_counts_the_backoff() {
        let policy = RetryConfig::new(2, 100, 2.0).without_jitter();
        let retried: Retried<()> =
            with_retry(&policy, || async { Err(ProviderError::RateLimited) }).await;

        assert_eq!(retried.elapsed, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn disabled_policy_dispatches_once() {
        let retried: Retried<()> =
            with_retry(&RetryConfig::disabled(), || async { Err(ProviderError::RateLimited) }).await;

        assert_eq!(retried.attempts, 1);
    }
}
