//! Provider registration records

use serde::{Deserialize, Serialize};
use voice_provider::{DeploymentMode, ProviderId, ProviderKind};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::retry::RetryConfig;

/// Static description of a provider
///
/// Immutable once registered, except for `enabled`, which the orchestrator
/// tracks live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRegistration {
    /// Unique identifier
    pub id: ProviderId,

    /// Operations the provider serves
    pub kind: ProviderKind,

    /// Lower is more preferred (default: 100)
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Initial enablement (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Where the provider runs
    pub deployment_mode: DeploymentMode,

    /// Latency estimate used until real samples exist
    #[serde(default)]
    pub estimated_latency_ms: Option<u64>,

    /// Cost estimate for the `cheap` strategy
    #[serde(default)]
    pub estimated_cost_per_month: Option<f64>,

    /// Concurrent requests the backend is sized for (default: 4)
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,

    /// Overall deadline per operation, overriding the global default
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Replaces the global retry policy for this provider
    #[serde(default)]
    pub retry_override: Option<RetryConfig>,

    /// Replaces the global circuit breaker policy for this provider
    #[serde(default)]
    pub circuit_breaker_override: Option<CircuitBreakerConfig>,
}

const fn default_priority() -> u32 {
    100
}

const fn default_enabled() -> bool {
    true
}

const fn default_max_concurrent_requests() -> u32 {
    4
}

impl ProviderRegistration {
    /// Registration with default priority and policies
    #[must_use]
    pub const fn new(id: ProviderId, kind: ProviderKind, deployment_mode: DeploymentMode) -> Self {
        Self {
            id,
            kind,
            priority: default_priority(),
            enabled: default_enabled(),
            deployment_mode,
            estimated_latency_ms: None,
            estimated_cost_per_month: None,
            max_concurrent_requests: default_max_concurrent_requests(),
            timeout_ms: None,
            retry_override: None,
            circuit_breaker_override: None,
        }
    }

    /// Set the priority
    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the initial enablement
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the latency estimate
    #[must_use]
    pub const fn with_estimated_latency_ms(mut self, latency_ms: u64) -> Self {
        self.estimated_latency_ms = Some(latency_ms);
        self
    }

    /// Set the cost estimate
    #[must_use]
    pub const fn with_estimated_cost_per_month(mut self, cost: f64) -> Self {
        self.estimated_cost_per_month = Some(cost);
        self
    }

    /// Set the per-operation deadline
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_override = Some(retry);
        self
    }

    /// Override the circuit breaker policy
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_override = Some(circuit_breaker);
        self
    }

    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = format!("providers.{}", self.id);

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::invalid(
                format!("{prefix}.max_concurrent_requests"),
                "must be greater than 0",
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                format!("{prefix}.timeout_ms"),
                "must be greater than 0 when set",
            ));
        }
        if let Some(cost) = self.estimated_cost_per_month {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConfigError::invalid(
                    format!("{prefix}.estimated_cost_per_month"),
                    "must be a non-negative number",
                ));
            }
        }
        if let Some(retry) = &self.retry_override {
            retry.validate(&format!("{prefix}.retry_override"))?;
        }
        if let Some(circuit) = &self.circuit_breaker_override {
            circuit.validate(&format!("{prefix}.circuit_breaker_override"))?;
        }
        Ok(())
    }
}
