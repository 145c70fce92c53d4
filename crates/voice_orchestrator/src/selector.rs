//! Provider selection
//!
//! Turns a snapshot of provider state into an ordered candidate list for one
//! request. Selection is a pure function of its inputs: the same snapshot and
//! request always produce the same ordering.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use voice_provider::{
    AudioFormat, DeploymentMode, OperationKind, ProviderCapabilities, ProviderId, ProviderKind,
};

use crate::circuit_breaker::CircuitPhase;
use crate::error::{ConfigError, OpenCircuit, OrchestratorError};
use crate::health::HealthStatus;
use crate::registration::ProviderRegistration;

/// How candidates are ranked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest rolling median latency first
    Fast,
    /// Highest configured priority first
    Accurate,
    /// Lowest estimated monthly cost first
    Cheap,
    /// Priority first, latency breaks ties
    #[default]
    Balanced,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Accurate => write!(f, "accurate"),
            Self::Cheap => write!(f, "cheap"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

/// Selection defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Strategy used when a request does not name one
    #[serde(default)]
    pub strategy: SelectionStrategy,

    /// Break ties in favour of local deployments
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,

    /// Preference order of deployment modes for `prefer_local`
    #[serde(default = "default_deployment_order")]
    pub deployment_order: Vec<DeploymentMode>,
}

const fn default_prefer_local() -> bool {
    true
}

fn default_deployment_order() -> Vec<DeploymentMode> {
    vec![
        DeploymentMode::Docker,
        DeploymentMode::System,
        DeploymentMode::Cloud,
    ]
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            prefer_local: default_prefer_local(),
            deployment_order: default_deployment_order(),
        }
    }
}

impl SelectionConfig {
    /// Check that the deployment order has no repeats
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, mode) in self.deployment_order.iter().enumerate() {
            if self.deployment_order[..i].contains(mode) {
                return Err(ConfigError::invalid(
                    "selection.deployment_order",
                    format!("'{mode}' is listed more than once"),
                ));
            }
        }
        Ok(())
    }
}

/// Per-call selection preferences
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Override the configured strategy
    pub strategy: Option<SelectionStrategy>,
    /// Override the configured `prefer_local`
    pub prefer_local: Option<bool>,
    /// Try this provider first if it is eligible
    pub provider_id: Option<ProviderId>,
    /// Required audio format
    pub format: Option<AudioFormat>,
    /// Required language
    pub language: Option<String>,
    /// Streaming support required
    pub streaming: bool,
    /// Overall deadline per candidate in milliseconds
    pub timeout_ms: Option<u64>,
}

impl SelectionRequest {
    /// Request with configured defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank with this strategy
    #[must_use]
    pub const fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Override `prefer_local`
    #[must_use]
    pub const fn with_prefer_local(mut self, prefer_local: bool) -> Self {
        self.prefer_local = Some(prefer_local);
        self
    }

    /// Try this provider first
    #[must_use]
    pub fn with_provider(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    /// Require an audio format
    #[must_use]
    pub const fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Require a language
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Require streaming support
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Overall deadline per candidate
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Everything the selector needs to know about one provider
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateView {
    /// Provider id
    pub id: ProviderId,
    /// Declared kind
    pub kind: ProviderKind,
    /// Lower is more preferred
    pub priority: u32,
    /// Live enablement flag
    pub enabled: bool,
    /// Where the provider runs
    pub deployment_mode: DeploymentMode,
    /// Latency estimate from the registration
    pub estimated_latency_ms: Option<u64>,
    /// Cost estimate from the registration
    pub estimated_cost_per_month: Option<f64>,
    /// Cached capability report
    pub capabilities: Option<ProviderCapabilities>,
    /// Circuit phase
    pub circuit: CircuitPhase,
    /// Remaining open window
    pub retry_after: Option<Duration>,
    /// Health status
    pub health: HealthStatus,
    /// Rolling median latency of successful dispatches
    pub p50_latency_ms: Option<u64>,
    /// Requests currently in flight
    pub in_flight: u32,
}

impl CandidateView {
    /// View of a declared provider before any runtime state exists
    ///
    /// Circuit closed, health unknown, capabilities unreported, idle.
    #[must_use]
    pub fn declared(registration: &ProviderRegistration) -> Self {
        Self {
            id: registration.id.clone(),
            kind: registration.kind,
            priority: registration.priority,
            enabled: registration.enabled,
            deployment_mode: registration.deployment_mode,
            estimated_latency_ms: registration.estimated_latency_ms,
            estimated_cost_per_month: registration.estimated_cost_per_month,
            capabilities: None,
            circuit: CircuitPhase::Closed,
            retry_after: None,
            health: HealthStatus::Unknown,
            p50_latency_ms: None,
            in_flight: 0,
        }
    }

    /// Latency used by the `fast` and `balanced` strategies
    fn latency_key(&self) -> u64 {
        self.p50_latency_ms
            .or(self.estimated_latency_ms)
            .or_else(|| {
                self.capabilities
                    .as_ref()
                    .and_then(|c| c.estimated_latency_ms)
            })
            .unwrap_or(u64::MAX)
    }

    fn cost_key(&self) -> f64 {
        self.estimated_cost_per_month.unwrap_or(0.0)
    }

    fn incompatibility(&self, request: &SelectionRequest) -> Option<String> {
        let capabilities = self.capabilities.as_ref()?;
        if let Some(format) = request.format {
            if !capabilities.supports_format(format) {
                return Some(format!("format {} not supported", format.extension()));
            }
        }
        if let Some(language) = &request.language {
            if !capabilities.supports_language(language) {
                return Some(format!("language '{language}' not supported"));
            }
        }
        if request.streaming && !capabilities.supports_streaming {
            return Some("streaming not supported".to_string());
        }
        None
    }
}

/// Why a provider was left out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Provider is disabled
    Disabled,
    /// Provider cannot serve this operation
    WrongKind,
    /// Capability report rules it out
    Incompatible {
        /// What is missing
        detail: String,
    },
    /// Circuit is open
    CircuitOpen {
        /// Remaining open window
        retry_after: Duration,
    },
    /// Health status is unhealthy
    Unhealthy,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::WrongKind => write!(f, "wrong kind"),
            Self::Incompatible { detail } => write!(f, "incompatible: {detail}"),
            Self::CircuitOpen { retry_after } => {
                write!(f, "circuit open, retry in {}ms", retry_after.as_millis())
            },
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A provider left out of the candidate list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    /// Excluded provider
    pub provider_id: ProviderId,
    /// Why
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.provider_id, self.reason)
    }
}

/// A ranked candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// Provider id
    pub provider_id: ProviderId,
    /// Configured priority, used for tier locking
    pub priority: u32,
}

/// Result of a selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    /// Requested operation
    pub operation: OperationKind,
    /// Candidates in the order they should be tried
    pub candidates: Vec<Candidate>,
    /// Providers left out and why
    pub excluded: Vec<Exclusion>,
    /// Only unhealthy providers were left, so they were kept
    pub degraded: bool,
}

impl Selection {
    /// Candidate ids in order
    #[must_use]
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.candidates
            .iter()
            .map(|c| c.provider_id.clone())
            .collect()
    }
}

/// Rank providers for one operation
///
/// `chain` is the configured fallback chain for the operation; when it is
/// absent every provider in `views` is considered.
pub fn select(
    operation: OperationKind,
    request: &SelectionRequest,
    config: &SelectionConfig,
    chain: Option<&[ProviderId]>,
    views: &[CandidateView],
) -> Result<Selection, OrchestratorError> {
    let base: Vec<&CandidateView> = match chain {
        Some(chain) if !chain.is_empty() => chain
            .iter()
            .filter_map(|id| views.iter().find(|v| &v.id == id))
            .collect(),
        _ => {
            let mut all: Vec<&CandidateView> = views
                .iter()
                .filter(|v| v.kind.supports(operation))
                .collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            all
        },
    };

    let mut excluded = Vec::new();
    let mut open = Vec::new();
    let mut survivors = Vec::new();

    for view in base {
        let reason = if !view.enabled {
            Some(ExclusionReason::Disabled)
        } else if !view.kind.supports(operation) {
            Some(ExclusionReason::WrongKind)
        } else if let Some(detail) = view.incompatibility(request) {
            Some(ExclusionReason::Incompatible { detail })
        } else if view.circuit == CircuitPhase::Open {
            let retry_after = view.retry_after.unwrap_or(Duration::ZERO);
            open.push(OpenCircuit {
                provider_id: view.id.clone(),
                retry_after,
            });
            Some(ExclusionReason::CircuitOpen { retry_after })
        } else {
            None
        };

        match reason {
            Some(reason) => excluded.push(Exclusion {
                provider_id: view.id.clone(),
                reason,
            }),
            None => survivors.push(view),
        }
    }

    if survivors.is_empty() {
        if open.is_empty() {
            return Err(OrchestratorError::NoHealthyProvider {
                operation,
                excluded,
            });
        }
        return Err(OrchestratorError::CircuitOpen {
            operation,
            providers: open,
        });
    }

    let has_usable = survivors.iter().any(|v| v.health != HealthStatus::Unhealthy);
    let degraded = !has_usable;
    if has_usable {
        survivors.retain(|view| {
            if view.health == HealthStatus::Unhealthy {
                excluded.push(Exclusion {
                    provider_id: view.id.clone(),
                    reason: ExclusionReason::Unhealthy,
                });
                false
            } else {
                true
            }
        });
    }

    let strategy = request.strategy.unwrap_or(config.strategy);
    let prefer_local = request.prefer_local.unwrap_or(config.prefer_local);
    survivors.sort_by(|a, b| compare(a, b, strategy, prefer_local, &config.deployment_order));

    if let Some(wanted) = &request.provider_id {
        if let Some(pos) = survivors.iter().position(|v| &v.id == wanted) {
            let preferred = survivors.remove(pos);
            survivors.insert(0, preferred);
        } else {
            debug!(provider = %wanted, "Requested provider is not eligible, ignoring preference");
        }
    }

    let candidates = survivors
        .into_iter()
        .map(|v| Candidate {
            provider_id: v.id.clone(),
            priority: v.priority,
        })
        .collect();

    Ok(Selection {
        operation,
        candidates,
        excluded,
        degraded,
    })
}

fn compare(
    a: &CandidateView,
    b: &CandidateView,
    strategy: SelectionStrategy,
    prefer_local: bool,
    deployment_order: &[DeploymentMode],
) -> Ordering {
    let primary = match strategy {
        SelectionStrategy::Fast => a.latency_key().cmp(&b.latency_key()),
        SelectionStrategy::Accurate => a.priority.cmp(&b.priority),
        SelectionStrategy::Cheap => a.cost_key().total_cmp(&b.cost_key()),
        SelectionStrategy::Balanced => a
            .priority
            .cmp(&b.priority)
            .then_with(|| a.latency_key().cmp(&b.latency_key())),
    };

    let local_rank = |view: &CandidateView| {
        deployment_order
            .iter()
            .position(|mode| *mode == view.deployment_mode)
            .unwrap_or(deployment_order.len())
    };

    primary
        .then_with(|| {
            if prefer_local {
                local_rank(a).cmp(&local_rank(b))
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.in_flight.cmp(&b.in_flight))
        .then_with(|| a.id.cmp(&b.id))
}
