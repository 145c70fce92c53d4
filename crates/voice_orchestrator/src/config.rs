//! Orchestrator configuration
//!
//! Every section deserializes with per-field defaults, so an empty file is a
//! valid configuration. [`OrchestratorConfig::load`] layers an optional TOML
//! file under `VOICE_ORCHESTRATOR__` environment variables, e.g.
//! `VOICE_ORCHESTRATOR__RETRY__MAX_RETRIES=4`.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voice_provider::{OperationKind, ProviderId};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::fallback::SwitchingConfig;
use crate::health::HealthConfig;
use crate::metrics::MetricsConfig;
use crate::registration::ProviderRegistration;
use crate::retry::RetryConfig;
use crate::selector::SelectionConfig;
use crate::telemetry::TelemetryConfig;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "VOICE_ORCHESTRATOR";
/// Separator between prefix, sections and keys in environment overrides
pub const ENV_SEPARATOR: &str = "__";

/// Ordered provider ids per operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackChains {
    /// Speech-to-text chain
    #[serde(default)]
    pub stt: Vec<ProviderId>,
    /// Text-to-speech chain
    #[serde(default)]
    pub tts: Vec<ProviderId>,
}

impl FallbackChains {
    /// Chain for an operation, `None` when not configured
    #[must_use]
    pub fn for_operation(&self, operation: OperationKind) -> Option<&[ProviderId]> {
        let chain = match operation {
            OperationKind::Stt => &self.stt,
            OperationKind::Tts => &self.tts,
        };
        if chain.is_empty() {
            None
        } else {
            Some(chain.as_slice())
        }
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Overall deadline per candidate in milliseconds (default: 30000)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Providers declared up front; executors are attached at runtime
    #[serde(default)]
    pub providers: Vec<ProviderRegistration>,

    /// Fallback chains per operation
    #[serde(default)]
    pub fallback_chains: FallbackChains,

    /// Health monitoring
    #[serde(default)]
    pub health: HealthConfig,

    /// Circuit breaking
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Selection defaults
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Fallback switching rules
    #[serde(default)]
    pub switching: SwitchingConfig,

    /// Metrics history and export
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging setup
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Capacity of the event channel (default: 256)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            providers: Vec::new(),
            fallback_chains: FallbackChains::default(),
            health: HealthConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            selection: SelectionConfig::default(),
            switching: SwitchingConfig::default(),
            metrics: MetricsConfig::default(),
            telemetry: TelemetryConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from an optional TOML file plus environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section and cross-references
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "default_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid(
                "event_capacity",
                "must be greater than 0",
            ));
        }

        self.health.validate()?;
        self.circuit_breaker.validate("circuit_breaker")?;
        self.retry.validate("retry")?;
        self.selection.validate()?;
        self.switching.validate()?;
        self.metrics.validate()?;
        self.telemetry.validate()?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(&provider.id) {
                return Err(ConfigError::DuplicateProvider(provider.id.clone()));
            }
        }

        for operation in [OperationKind::Stt, OperationKind::Tts] {
            self.validate_chain(operation)?;
        }
        Ok(())
    }

    fn validate_chain(&self, operation: OperationKind) -> Result<(), ConfigError> {
        let Some(chain) = self.fallback_chains.for_operation(operation) else {
            return Ok(());
        };

        let mut seen = HashSet::new();
        for provider_id in chain {
            if !seen.insert(provider_id) {
                return Err(ConfigError::DuplicateChainEntry {
                    operation,
                    provider_id: provider_id.clone(),
                });
            }
            let Some(provider) = self.provider(provider_id) else {
                return Err(ConfigError::UnknownChainProvider {
                    operation,
                    provider_id: provider_id.clone(),
                });
            };
            if !provider.kind.supports(operation) {
                return Err(ConfigError::ChainKindMismatch {
                    operation,
                    provider_id: provider_id.clone(),
                    kind: provider.kind,
                });
            }
        }
        Ok(())
    }

    /// Declared registration for a provider
    #[must_use]
    pub fn provider(&self, id: &ProviderId) -> Option<&ProviderRegistration> {
        self.providers.iter().find(|p| &p.id == id)
    }

    /// Global default deadline
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
