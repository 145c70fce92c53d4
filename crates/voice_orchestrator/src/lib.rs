//! Voice Orchestrator - provider selection and failover for speech backends
//!
//! Drives any number of [`voice_provider::VoiceProviderExecutor`]s behind one
//! facade:
//! - `selector` - ranks eligible providers per request
//! - `health` - periodic checks with hysteresis
//! - `circuit_breaker` - closed / open / half-open dispatch gating
//! - `retry` - exponential backoff for transient errors
//! - `fallback` - sequential switching across ranked candidates
//! - `metrics` - bounded per-provider latency and error history
//! - `events` - broadcast notifications of state changes
//!
//! # Example
//!
//! ```ignore
//! use voice_orchestrator::{OrchestratorConfig, SelectionRequest, VoiceOrchestrator};
//!
//! let orchestrator = VoiceOrchestrator::new(OrchestratorConfig::default())?;
//! orchestrator.register(registration, Arc::new(executor)).await?;
//! let outcome = orchestrator
//!     .synthesize(&SelectionRequest::new(), "Hallo", &SynthesisOptions::default())
//!     .await?;
//! ```

pub mod circuit_breaker;
pub mod config;
mod dispatch;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod metrics;
mod monitor;
pub mod orchestrator;
pub mod registration;
mod registry;
pub mod retry;
pub mod selector;
pub mod telemetry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitPhase, CircuitSnapshot,
};
pub use config::{FallbackChains, OrchestratorConfig};
pub use error::{ConfigError, ExhaustionReason, OpenCircuit, OrchestratorError};
pub use events::{EventBus, OrchestratorEvent};
pub use fallback::{AttemptOutcome, AttemptRecord, SessionReport, SwitchingConfig};
pub use health::{HealthCheckStrategy, HealthConfig, HealthState, HealthStatus};
pub use metrics::{
    ExportError, MetricsAggregator, MetricsConfig, MetricsSink, MetricsSnapshot, MetricsSummary,
    TracingMetricsSink,
};
pub use orchestrator::{OperationOutcome, ProviderStatus, VoiceOrchestrator};
pub use registration::ProviderRegistration;
pub use retry::RetryConfig;
pub use selector::{
    Candidate, Exclusion, ExclusionReason, Selection, SelectionConfig, SelectionRequest,
    SelectionStrategy,
};
pub use telemetry::{TelemetryConfig, TelemetryError, init_tracing};
