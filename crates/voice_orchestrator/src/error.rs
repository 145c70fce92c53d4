//! Orchestrator and configuration errors

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use voice_provider::{InvalidProviderId, OperationKind, ProviderError, ProviderId, ProviderKind};

use crate::fallback::AttemptRecord;
use crate::selector::Exclusion;

/// Errors raised while loading or validating configuration
///
/// Only produced by `validate()`, `load()` and provider registration, never
/// while dispatching an operation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment source could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A field is out of range or inconsistent
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidField {
        /// Dotted path of the offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// A provider identifier failed validation
    #[error("Invalid provider id: {0}")]
    InvalidProviderId(#[from] InvalidProviderId),

    /// Two providers share an identifier
    #[error("Provider '{0}' is declared more than once")]
    DuplicateProvider(ProviderId),

    /// A fallback chain names a provider that is not declared
    #[error("Fallback chain for {operation} references unknown provider '{provider_id}'")]
    UnknownChainProvider {
        /// Chain the entry belongs to
        operation: OperationKind,
        /// Unknown identifier
        provider_id: ProviderId,
    },

    /// A fallback chain names a provider that cannot serve the operation
    #[error("Fallback chain for {operation} references '{provider_id}' of kind {kind}")]
    ChainKindMismatch {
        /// Chain the entry belongs to
        operation: OperationKind,
        /// Offending identifier
        provider_id: ProviderId,
        /// Declared provider kind
        kind: ProviderKind,
    },

    /// A fallback chain lists the same provider twice
    #[error("Fallback chain for {operation} lists '{provider_id}' more than once")]
    DuplicateChainEntry {
        /// Chain the entry belongs to
        operation: OperationKind,
        /// Repeated identifier
        provider_id: ProviderId,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidField`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Why a fallback session gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionReason {
    /// Fallback is switched off and the first candidate failed
    FallbackDisabled,
    /// `max_switches` was already used up
    MaxSwitchesReached,
    /// Every ranked candidate was tried or skipped
    NoCandidatesLeft,
    /// Tier locking left no candidate with the first candidate's priority
    TierExhausted,
    /// Streaming input was consumed and cannot be offered to another provider
    InputNotReplayable,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FallbackDisabled => write!(f, "fallback disabled"),
            Self::MaxSwitchesReached => write!(f, "max switches reached"),
            Self::NoCandidatesLeft => write!(f, "no candidates left"),
            Self::TierExhausted => write!(f, "priority tier exhausted"),
            Self::InputNotReplayable => write!(f, "input stream not replayable"),
        }
    }
}

/// A provider refused because its circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenCircuit {
    /// Provider whose circuit is open
    pub provider_id: ProviderId,
    /// Time until the circuit admits a trial
    pub retry_after: Duration,
}

/// Errors returned by the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration or registration is invalid
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// No provider with this identifier is registered (or declared)
    #[error("Unknown provider '{0}'")]
    UnknownProvider(ProviderId),

    /// A provider with this identifier is already registered
    #[error("Provider '{0}' is already registered")]
    DuplicateProvider(ProviderId),

    /// The executor failed its `initialize()` call
    #[error("Provider '{provider_id}' failed to initialize: {source}")]
    Initialization {
        /// Provider being registered
        provider_id: ProviderId,
        /// Error reported by the executor
        #[source]
        source: ProviderError,
    },

    /// The request was rejected before any dispatch
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Every otherwise eligible candidate has an open circuit
    #[error("All circuits open for {operation}: {}", format_open(.providers))]
    CircuitOpen {
        /// Requested operation
        operation: OperationKind,
        /// Open providers with their remaining wait
        providers: Vec<OpenCircuit>,
    },

    /// No provider survived selection
    #[error("No eligible provider for {operation}: {}", format_exclusions(.excluded))]
    NoHealthyProvider {
        /// Requested operation
        operation: OperationKind,
        /// Why each provider was excluded
        excluded: Vec<Exclusion>,
    },

    /// Every attempted candidate failed
    #[error(
        "All providers exhausted for {operation} ({reason}); last error: {}; attempts: [{}]",
        format_last_error(.last_error),
        format_attempts(.attempts)
    )]
    AllProvidersExhausted {
        /// Requested operation
        operation: OperationKind,
        /// Why the session stopped
        reason: ExhaustionReason,
        /// Error of the last failed candidate
        last_error: Option<ProviderError>,
        /// Audit trail of the session
        attempts: Vec<AttemptRecord>,
    },

    /// A provider reported a permanent error; no retry or fallback happened
    #[error("Provider '{provider_id}' rejected the request: {source}")]
    Rejected {
        /// Provider that rejected the request
        provider_id: ProviderId,
        /// The permanent error
        #[source]
        source: ProviderError,
        /// Audit trail of the session
        attempts: Vec<AttemptRecord>,
    },

    /// The orchestrator has been shut down
    #[error("Orchestrator is shut down")]
    ShutDown,
}

impl OrchestratorError {
    /// Audit trail of the failed session, if the error came from dispatching
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::AllProvidersExhausted { attempts, .. } | Self::Rejected { attempts, .. } => {
                attempts
            },
            _ => &[],
        }
    }
}

fn format_open(providers: &[OpenCircuit]) -> String {
    providers
        .iter()
        .map(|p| format!("{} (retry in {}ms)", p.provider_id, p.retry_after.as_millis()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_exclusions(excluded: &[Exclusion]) -> String {
    if excluded.is_empty() {
        return "no providers registered".to_string();
    }
    excluded
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_last_error(error: &Option<ProviderError>) -> String {
    error
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}

fn format_attempts(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::AttemptOutcome;

    fn id(s: &str) -> ProviderId {
        ProviderId::parse(s).unwrap()
    }

    #[test]
    fn circuit_open_lists_every_provider() {
        let err = OrchestratorError::CircuitOpen {
            operation: OperationKind::Stt,
            providers: vec![
                OpenCircuit {
                    provider_id: id("a"),
                    retry_after: Duration::from_millis(1500),
                },
                OpenCircuit {
                    provider_id: id("b"),
                    retry_after: Duration::from_millis(20_000),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("a (retry in 1500ms)"), "{msg}");
        assert!(msg.contains("b (retry in 20000ms)"), "{msg}");
    }

    #[test]
    fn exhausted_shows_last_error_and_trail() {
        let err = OrchestratorError::AllProvidersExhausted {
            operation: OperationKind::Tts,
            reason: ExhaustionReason::MaxSwitchesReached,
            last_error: Some(ProviderError::RateLimited),
            attempts: vec![
                AttemptRecord {
                    provider_id: id("primary"),
                    dispatches: 3,
                    outcome: AttemptOutcome::Failed,
                    error: Some(ProviderError::Timeout(2000)),
                    elapsed_ms: 2000,
                },
                AttemptRecord {
                    provider_id: id("backup"),
                    dispatches: 1,
                    outcome: AttemptOutcome::Failed,
                    error: Some(ProviderError::RateLimited),
                    elapsed_ms: 12,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("max switches reached"), "{msg}");
        assert!(msg.contains("last error: Rate limit exceeded"), "{msg}");
        assert!(msg.contains("primary"), "{msg}");
        assert!(msg.contains("backup"), "{msg}");
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn config_error_helper() {
        let err = ConfigError::invalid("retry.max_retries", "must be at most 10");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for 'retry.max_retries': must be at most 10"
        );
    }
}
