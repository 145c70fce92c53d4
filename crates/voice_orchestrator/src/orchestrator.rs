//! The orchestrator facade
//!
//! [`VoiceOrchestrator`] owns the provider registry and every piece of
//! per-provider state (health, circuit, metrics, cooldowns). It is a cheap
//! `Clone` handle; background tasks spawned by [`VoiceOrchestrator::start`]
//! hold weak references and end when the last handle is dropped or
//! [`VoiceOrchestrator::shutdown`] is called.
//!
//! # Example
//!
//! ```ignore
//! use voice_orchestrator::{OrchestratorConfig, SelectionRequest, VoiceOrchestrator};
//!
//! let orchestrator = VoiceOrchestrator::new(OrchestratorConfig::load(None)?)?;
//! orchestrator
//!     .attach(&ProviderId::parse("whisper-docker")?, Arc::new(whisper))
//!     .await?;
//! orchestrator.start()?;
//!
//! let outcome = orchestrator
//!     .transcribe(&SelectionRequest::new(), &audio, &TranscriptionOptions::default())
//!     .await?;
//! println!("{} via {}", outcome.output.text, outcome.report.provider_id);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use voice_provider::{
    AudioBuffer, AudioInputStream, AudioStream, OperationKind, ProviderError, ProviderId,
    ProviderKind, SynthesisOptions, TranscriptStream, TranscriptionOptions, TranscriptionResult,
    VoiceProviderExecutor,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitTransition};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::fallback::{CooldownTracker, SessionReport};
use crate::health::{HealthState, HealthTracker, HealthTransition};
use crate::metrics::{MetricsAggregator, MetricsSink, MetricsSnapshot, MetricsSummary, TracingMetricsSink};
use crate::monitor;
use crate::registration::ProviderRegistration;
use crate::registry::{ProviderSlot, Registry};
use crate::selector::{self, CandidateView, Selection, SelectionRequest};

/// Result of a successful operation with its session report
#[derive(Debug)]
pub struct OperationOutcome<T> {
    /// Operation output
    pub output: T,
    /// Which providers were tried and how
    pub report: SessionReport,
}

/// Per-provider view returned by [`VoiceOrchestrator::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    /// Provider id
    pub provider_id: ProviderId,
    /// Declared kind
    pub kind: ProviderKind,
    /// Configured priority
    pub priority: u32,
    /// Live enablement flag
    pub enabled: bool,
    /// Backend name reported by the executor
    pub backend: String,
    /// Health state
    pub health: HealthState,
    /// Circuit state
    pub circuit: CircuitSnapshot,
    /// Rolling metrics
    pub metrics: MetricsSummary,
    /// Remaining fallback cooldown
    pub cooldown_remaining_ms: Option<u64>,
    /// Requests currently in flight
    pub in_flight: u32,
}

/// Shared state behind every handle
pub(crate) struct Inner {
    pub config: OrchestratorConfig,
    pub registry: Registry,
    pub metrics: MetricsAggregator,
    pub cooldowns: CooldownTracker,
    pub events: EventBus,
    pub sink: RwLock<Arc<dyn MetricsSink>>,
    running: AtomicBool,
    shut_down: AtomicBool,
    export_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub fn ensure_open(&self) -> Result<(), OrchestratorError> {
        if self.is_shut_down() {
            return Err(OrchestratorError::ShutDown);
        }
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn slot(&self, provider_id: &ProviderId) -> Result<Arc<ProviderSlot>, OrchestratorError> {
        self.registry
            .get(provider_id)
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider_id.clone()))
    }

    pub fn views(&self, operation: OperationKind) -> Vec<CandidateView> {
        self.registry
            .all()
            .iter()
            .map(|slot| slot.view(&self.metrics, operation))
            .collect()
    }

    pub fn plan(
        &self,
        operation: OperationKind,
        request: &SelectionRequest,
    ) -> Result<Selection, OrchestratorError> {
        let views = self.views(operation);
        let chain = self.config.fallback_chains.for_operation(operation);
        let selection = selector::select(operation, request, &self.config.selection, chain, &views)?;
        debug!(
            operation = %operation,
            candidates = ?selection.provider_ids(),
            excluded = selection.excluded.len(),
            degraded = selection.degraded,
            "Selected candidates"
        );
        Ok(selection)
    }

    pub fn publish_circuit(&self, provider_id: &ProviderId, transition: Option<CircuitTransition>) {
        match transition {
            Some(CircuitTransition::Opened { retry_after, reopens }) => {
                self.events.publish(OrchestratorEvent::CircuitOpened {
                    provider_id: provider_id.clone(),
                    retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    reopens,
                });
            },
            Some(CircuitTransition::Closed) => {
                self.events.publish(OrchestratorEvent::CircuitClosed {
                    provider_id: provider_id.clone(),
                });
            },
            None => {},
        }
    }

    pub fn publish_health(&self, slot: &ProviderSlot, transition: Option<HealthTransition>) {
        match transition {
            Some(HealthTransition::Degraded {
                consecutive_failures,
            }) => {
                let last_error = slot.health.snapshot().last_error;
                warn!(
                    provider = %slot.id(),
                    consecutive_failures,
                    error = last_error.as_deref().unwrap_or(""),
                    "Provider marked unhealthy"
                );
                self.events.publish(OrchestratorEvent::HealthDegraded {
                    provider_id: slot.id().clone(),
                    consecutive_failures,
                    last_error,
                });
            },
            Some(HealthTransition::Recovered {
                consecutive_successes,
            }) => {
                info!(
                    provider = %slot.id(),
                    consecutive_successes,
                    "Provider marked healthy"
                );
                self.events.publish(OrchestratorEvent::HealthRecovered {
                    provider_id: slot.id().clone(),
                    consecutive_successes,
                });
            },
            None => {},
        }
    }

    /// Feed an operation success into health, then publish both changes
    ///
    /// Metrics are recorded per dispatch by the caller.
    pub fn report_success(
        &self,
        slot: &ProviderSlot,
        latency: Duration,
        circuit: Option<CircuitTransition>,
    ) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let transition = slot.health.record_success(Some(latency_ms));
        self.publish_circuit(slot.id(), circuit);
        self.publish_health(slot, transition);
    }

    /// Feed an operation failure into health, then publish both changes
    ///
    /// Metrics are recorded per dispatch by the caller.
    pub fn report_failure(
        &self,
        slot: &ProviderSlot,
        error: &ProviderError,
        circuit: Option<CircuitTransition>,
    ) {
        let transition = slot.health.record_failure(error.to_string());
        self.publish_circuit(slot.id(), circuit);
        self.publish_health(slot, transition);
    }

    fn spawn_health_loop(self: &Arc<Self>, slot: &ProviderSlot) {
        if !self.config.health.enabled || slot.has_health_task() {
            return;
        }
        let task = monitor::spawn_health_loop(Arc::downgrade(self), slot.id().clone());
        slot.set_health_task(task);
    }
}

/// Selects, monitors and fails over between voice providers
#[derive(Clone)]
pub struct VoiceOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VoiceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceOrchestrator")
            .field("providers", &self.inner.registry.all().len())
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .field("shut_down", &self.inner.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl VoiceOrchestrator {
    /// Create an orchestrator from a validated configuration
    ///
    /// Providers declared in the configuration are registered once their
    /// executor is supplied through [`attach`](Self::attach).
    pub fn new(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let metrics = MetricsAggregator::new(config.metrics.clone());
        let events = EventBus::new(config.event_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: Registry::default(),
                metrics,
                cooldowns: CooldownTracker::new(),
                events,
                sink: RwLock::new(Arc::new(TracingMetricsSink)),
                running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                export_task: Mutex::new(None),
            }),
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Register a provider
    ///
    /// Validates the registration, calls `initialize()` and caches the
    /// capability report. A failed capability report is logged and leaves
    /// the provider unfiltered by capabilities until the next metadata check.
    #[instrument(skip_all, fields(provider = %registration.id))]
    pub async fn register(
        &self,
        registration: ProviderRegistration,
        executor: Arc<dyn VoiceProviderExecutor>,
    ) -> Result<(), OrchestratorError> {
        self.inner.ensure_open()?;
        registration.validate()?;
        let provider_id = registration.id.clone();
        if self.inner.registry.contains(&provider_id) {
            return Err(OrchestratorError::DuplicateProvider(provider_id));
        }

        executor
            .initialize()
            .await
            .map_err(|source| OrchestratorError::Initialization {
                provider_id: provider_id.clone(),
                source,
            })?;

        let capabilities = match executor.capabilities().await {
            Ok(capabilities) => Some(capabilities),
            Err(e) => {
                warn!(error = %e, "Provider did not report capabilities");
                None
            },
        };

        let circuit_config = registration
            .circuit_breaker_override
            .clone()
            .unwrap_or_else(|| self.inner.config.circuit_breaker.clone());
        let kind = registration.kind;
        let slot = Arc::new(ProviderSlot::new(
            registration,
            Arc::clone(&executor),
            capabilities,
            HealthTracker::new(&self.inner.config.health),
            CircuitBreaker::new(provider_id.clone(), circuit_config),
        ));

        if self.inner.registry.insert(Arc::clone(&slot)).is_err() {
            executor.shutdown().await;
            return Err(OrchestratorError::DuplicateProvider(provider_id));
        }

        info!(kind = %kind, backend = executor.name(), "Provider registered");
        self.inner.events.publish(OrchestratorEvent::ProviderRegistered {
            provider_id,
            kind,
        });

        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.spawn_health_loop(&slot);
        }
        Ok(())
    }

    /// Register a provider declared in the configuration
    pub async fn attach(
        &self,
        provider_id: &ProviderId,
        executor: Arc<dyn VoiceProviderExecutor>,
    ) -> Result<(), OrchestratorError> {
        let registration = self
            .inner
            .config
            .provider(provider_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider_id.clone()))?;
        self.register(registration, executor).await
    }

    /// Remove a provider, stopping its health loop and shutting it down
    #[instrument(skip_all, fields(provider = %provider_id))]
    pub async fn remove(&self, provider_id: &ProviderId) -> Result<(), OrchestratorError> {
        self.inner.ensure_open()?;
        let slot = self
            .inner
            .registry
            .remove(provider_id)
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider_id.clone()))?;

        slot.stop_health_task();
        slot.executor.shutdown().await;
        self.inner.metrics.remove(provider_id);
        self.inner.cooldowns.clear(provider_id);

        info!("Provider removed");
        self.inner.events.publish(OrchestratorEvent::ProviderRemoved {
            provider_id: provider_id.clone(),
        });
        Ok(())
    }

    /// Enable or disable a provider
    ///
    /// Disabled providers are never selected and not health-checked.
    pub fn set_enabled(&self, provider_id: &ProviderId, enabled: bool) -> Result<(), OrchestratorError> {
        self.inner.ensure_open()?;
        let slot = self.inner.slot(provider_id)?;
        if slot.set_enabled(enabled) != enabled {
            info!(provider = %provider_id, enabled, "Provider enablement changed");
            self.inner.events.publish(OrchestratorEvent::ProviderEnabledChanged {
                provider_id: provider_id.clone(),
                enabled,
            });
        }
        Ok(())
    }

    /// Replace the metrics export destination
    pub fn set_metrics_sink(&self, sink: Arc<dyn MetricsSink>) {
        *self.inner.sink.write() = sink;
    }

    /// Start the health monitor and the metrics export loop
    ///
    /// Must be called from within a Tokio runtime. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        self.inner.ensure_open()?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for slot in self.inner.registry.all() {
            self.inner.spawn_health_loop(&slot);
        }

        if let Some(period) = self.inner.config.metrics.export_interval_ms {
            let task = monitor::spawn_metrics_export(
                Arc::downgrade(&self.inner),
                Duration::from_millis(period),
            );
            *self.inner.export_task.lock() = Some(task);
        }

        info!(
            providers = self.inner.registry.all().len(),
            health_checks = self.inner.config.health.enabled,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop background tasks and shut down every executor
    ///
    /// Idempotent; every later operation returns [`OrchestratorError::ShutDown`].
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Orchestrator already shut down");
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);

        if let Some(task) = self.inner.export_task.lock().take() {
            task.abort();
        }

        let slots = self.inner.registry.drain();
        for slot in &slots {
            slot.stop_health_task();
        }
        for slot in &slots {
            slot.executor.shutdown().await;
        }
        info!(providers = slots.len(), "Orchestrator shut down");
    }

    /// Ranked candidates for an operation without dispatching
    pub fn select(
        &self,
        operation: OperationKind,
        request: &SelectionRequest,
    ) -> Result<Selection, OrchestratorError> {
        self.inner.ensure_open()?;
        self.inner.plan(operation, request)
    }

    /// Text to speech with retry and fallback
    #[instrument(skip_all, fields(operation = %OperationKind::Tts))]
    pub async fn synthesize(
        &self,
        request: &SelectionRequest,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<OperationOutcome<AudioBuffer>, OrchestratorError> {
        self.inner.synthesize(request, text, options).await
    }

    /// Speech to text with retry and fallback
    #[instrument(skip_all, fields(operation = %OperationKind::Stt))]
    pub async fn transcribe(
        &self,
        request: &SelectionRequest,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<OperationOutcome<TranscriptionResult>, OrchestratorError> {
        self.inner.transcribe(request, audio, options).await
    }

    /// Streaming text to speech
    ///
    /// Fallback only happens before the first chunk. A failure after that
    /// is reported against the provider and ends the stream.
    #[instrument(skip_all, fields(operation = %OperationKind::Tts))]
    pub async fn synthesize_stream(
        &self,
        request: &SelectionRequest,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<OperationOutcome<AudioStream>, OrchestratorError> {
        Arc::clone(&self.inner)
            .synthesize_stream(request, text, options)
            .await
    }

    /// Streaming speech to text
    ///
    /// The input stream cannot be replayed, so only one provider is tried.
    #[instrument(skip_all, fields(operation = %OperationKind::Stt))]
    pub async fn transcribe_stream(
        &self,
        request: &SelectionRequest,
        audio: AudioInputStream,
        options: &TranscriptionOptions,
    ) -> Result<OperationOutcome<TranscriptStream>, OrchestratorError> {
        Arc::clone(&self.inner)
            .transcribe_stream(request, audio, options)
            .await
    }

    /// Report an operation that succeeded outside the orchestrator
    pub fn record_success(
        &self,
        provider_id: &ProviderId,
        operation: OperationKind,
        latency: Duration,
    ) -> Result<(), OrchestratorError> {
        self.inner.ensure_open()?;
        let slot = self.inner.slot(provider_id)?;
        self.inner
            .metrics
            .record_success(provider_id, operation, latency);
        let transition = slot.circuit.record_success();
        self.inner.report_success(&slot, latency, transition);
        Ok(())
    }

    /// Report an operation that failed outside the orchestrator
    pub fn record_failure(
        &self,
        provider_id: &ProviderId,
        operation: OperationKind,
        error: &ProviderError,
    ) -> Result<(), OrchestratorError> {
        self.inner.ensure_open()?;
        let slot = self.inner.slot(provider_id)?;
        self.inner
            .metrics
            .record_failure(provider_id, operation, Duration::ZERO, error);
        let transition = slot.circuit.record_failure();
        self.inner.report_failure(&slot, error, transition);
        Ok(())
    }

    /// Run one health check now
    ///
    /// Returns `None` when the provider is disabled or a check is already
    /// running for it.
    pub async fn tick_health_check(
        &self,
        provider_id: &ProviderId,
    ) -> Result<Option<HealthState>, OrchestratorError> {
        self.inner.ensure_open()?;
        monitor::check_provider(&self.inner, provider_id).await
    }

    /// Subscribe to orchestrator events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Per-provider state, ordered by id
    #[must_use]
    pub fn status(&self) -> Vec<ProviderStatus> {
        self.inner
            .registry
            .all()
            .iter()
            .map(|slot| ProviderStatus {
                provider_id: slot.id().clone(),
                kind: slot.registration.kind,
                priority: slot.registration.priority,
                enabled: slot.is_enabled(),
                backend: slot.executor.name().to_string(),
                health: slot.health.snapshot(),
                circuit: slot.circuit.snapshot(),
                metrics: self.inner.metrics.summary(slot.id()),
                cooldown_remaining_ms: self
                    .inner
                    .cooldowns
                    .remaining(slot.id())
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                in_flight: slot.in_flight(),
            })
            .collect()
    }

    /// Rolling metrics of every provider
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}
