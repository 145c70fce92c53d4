//! Registered providers and their live state

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use voice_provider::{OperationKind, ProviderCapabilities, ProviderId, VoiceProviderExecutor};

use crate::circuit_breaker::CircuitBreaker;
use crate::health::HealthTracker;
use crate::metrics::MetricsAggregator;
use crate::registration::ProviderRegistration;
use crate::retry::RetryConfig;
use crate::selector::CandidateView;

/// One registered provider
pub(crate) struct ProviderSlot {
    pub registration: ProviderRegistration,
    pub executor: Arc<dyn VoiceProviderExecutor>,
    pub health: HealthTracker,
    pub circuit: CircuitBreaker,
    enabled: AtomicBool,
    capabilities: RwLock<Option<ProviderCapabilities>>,
    in_flight: AtomicU32,
    checking: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("id", &self.registration.id)
            .field("executor", &self.executor.name())
            .field("enabled", &self.is_enabled())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl ProviderSlot {
    pub fn new(
        registration: ProviderRegistration,
        executor: Arc<dyn VoiceProviderExecutor>,
        capabilities: Option<ProviderCapabilities>,
        health: HealthTracker,
        circuit: CircuitBreaker,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(registration.enabled),
            registration,
            executor,
            health,
            circuit,
            capabilities: RwLock::new(capabilities),
            in_flight: AtomicU32::new(0),
            checking: AtomicBool::new(false),
            health_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.registration.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the previous value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }

    pub fn capabilities(&self) -> Option<ProviderCapabilities> {
        self.capabilities.read().clone()
    }

    pub fn set_capabilities(&self, capabilities: ProviderCapabilities) {
        *self.capabilities.write() = Some(capabilities);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a request as in flight until the guard drops
    pub fn begin_request(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { slot: self }
    }

    /// Claim the health-check flag, `None` if a check is already running
    pub fn begin_check(&self) -> Option<CheckGuard<'_>> {
        self.checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CheckGuard { slot: self })
    }

    pub fn has_health_task(&self) -> bool {
        self.health_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn set_health_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.health_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn stop_health_task(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }

    pub fn retry_config<'a>(&'a self, global: &'a RetryConfig) -> &'a RetryConfig {
        self.registration.retry_override.as_ref().unwrap_or(global)
    }

    /// Deadline per candidate: request, then provider, then global
    pub fn deadline(&self, request_ms: Option<u64>, global: Duration) -> Duration {
        request_ms
            .or(self.registration.timeout_ms)
            .map_or(global, Duration::from_millis)
    }

    /// Snapshot for ranking `operation`; latency only counts that operation's samples
    pub fn view(&self, metrics: &MetricsAggregator, operation: OperationKind) -> CandidateView {
        let circuit = self.circuit.snapshot();
        CandidateView {
            id: self.registration.id.clone(),
            kind: self.registration.kind,
            priority: self.registration.priority,
            enabled: self.is_enabled(),
            deployment_mode: self.registration.deployment_mode,
            estimated_latency_ms: self.registration.estimated_latency_ms,
            estimated_cost_per_month: self.registration.estimated_cost_per_month,
            capabilities: self.capabilities(),
            circuit: circuit.phase,
            retry_after: circuit.retry_after,
            health: self.health.status(),
            p50_latency_ms: metrics.p50_latency_ms(&self.registration.id, operation),
            in_flight: self.in_flight(),
        }
    }
}

pub(crate) struct InFlightGuard<'a> {
    slot: &'a ProviderSlot,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct CheckGuard<'a> {
    slot: &'a ProviderSlot,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.slot.checking.store(false, Ordering::SeqCst);
    }
}

/// Providers keyed by id
#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: RwLock<BTreeMap<ProviderId, Arc<ProviderSlot>>>,
}

impl Registry {
    pub fn get(&self, provider_id: &ProviderId) -> Option<Arc<ProviderSlot>> {
        self.slots.read().get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &ProviderId) -> bool {
        self.slots.read().contains_key(provider_id)
    }

    /// Insert unless the id is taken; hands the slot back on conflict
    pub fn insert(&self, slot: Arc<ProviderSlot>) -> Result<(), Arc<ProviderSlot>> {
        let mut slots = self.slots.write();
        if slots.contains_key(slot.id()) {
            return Err(slot);
        }
        slots.insert(slot.id().clone(), slot);
        Ok(())
    }

    pub fn remove(&self, provider_id: &ProviderId) -> Option<Arc<ProviderSlot>> {
        self.slots.write().remove(provider_id)
    }

    /// Every slot, ordered by id
    pub fn all(&self) -> Vec<Arc<ProviderSlot>> {
        self.slots.read().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<ProviderSlot>> {
        std::mem::take(&mut *self.slots.write()).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use voice_provider::testing::ScriptedExecutor;
    use voice_provider::{DeploymentMode, ProviderKind};

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::health::HealthConfig;
    use crate::metrics::MetricsConfig;

    fn slot(name: &str) -> Arc<ProviderSlot> {
        let id = ProviderId::parse(name).unwrap();
        let registration = ProviderRegistration::new(id.clone(), ProviderKind::Stt, DeploymentMode::Docker)
            .with_priority(3)
            .with_timeout_ms(1_500);
        Arc::new(ProviderSlot::new(
            registration,
            Arc::new(ScriptedExecutor::new(name)),
            None,
            HealthTracker::new(&HealthConfig::default()),
            CircuitBreaker::new(id, CircuitBreakerConfig::default()),
        ))
    }

    #[test]
    fn rejects_duplicate_ids() {
        let registry = Registry::default();
        assert!(registry.insert(slot("a")).is_ok());
        assert!(registry.insert(slot("a")).is_err());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn all_is_ordered_by_id() {
        let registry = Registry::default();
        for name in ["c", "a", "b"] {
            registry.insert(slot(name)).unwrap();
        }
        let ids: Vec<_> = registry.all().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn in_flight_guard_tracks_load() {
        let slot = slot("a");
        let first = slot.begin_request();
        let second = slot.begin_request();
        assert_eq!(slot.in_flight(), 2);
        drop(first);
        drop(second);
        assert_eq!(slot.in_flight(), 0);
    }

    #[test]
    fn check_flag_excludes_overlap() {
        let slot = slot("a");
        let guard = slot.begin_check();
        assert!(guard.is_some());
        assert!(slot.begin_check().is_none());
        drop(guard);
        assert!(slot.begin_check().is_some());
    }

    #[test]
    fn deadline_prefers_request_then_provider() {
        let slot = slot("a");
        let global = Duration::from_secs(30);
        assert_eq!(slot.deadline(Some(200), global), Duration::from_millis(200));
        assert_eq!(slot.deadline(None, global), Duration::from_millis(1_500));
    }

    #[test]
    fn view_reflects_live_state() {
        let slot = slot("a");
        slot.set_enabled(false);
        let _load = slot.begin_request();
        let view = slot.view(&MetricsAggregator::new(MetricsConfig::default()), OperationKind::Stt);
        assert!(!view.enabled);
        assert_eq!(view.priority, 3);
        assert_eq!(view.in_flight, 1);
        assert!(view.p50_latency_ms.is_none());
    }

    #[test]
    fn view_latency_counts_only_the_ranked_operation() {
        let slot = slot("a");
        let metrics = MetricsAggregator::new(MetricsConfig::default());
        metrics.record_success(slot.id(), OperationKind::Tts, Duration::from_millis(20));
        assert!(slot.view(&metrics, OperationKind::Stt).p50_latency_ms.is_none());

        metrics.record_success(slot.id(), OperationKind::Stt, Duration::from_millis(700));
        assert_eq!(slot.view(&metrics, OperationKind::Stt).p50_latency_ms, Some(700));
        assert_eq!(slot.view(&metrics, OperationKind::Tts).p50_latency_ms, Some(20));
    }
}
