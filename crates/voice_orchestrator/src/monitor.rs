//! Background health checks and metrics export

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use voice_provider::ProviderId;

use crate::error::OrchestratorError;
use crate::events::OrchestratorEvent;
use crate::health::{self, HealthState};
use crate::orchestrator::Inner;

/// Run one health check and apply its outcome
///
/// Returns `Ok(None)` when the provider is disabled or already being checked.
pub(crate) async fn check_provider(
    inner: &Inner,
    provider_id: &ProviderId,
) -> Result<Option<HealthState>, OrchestratorError> {
    let slot = inner.slot(provider_id)?;
    if !slot.is_enabled() {
        debug!(provider = %provider_id, "Skipping health check for disabled provider");
        return Ok(None);
    }
    let Some(_check) = slot.begin_check() else {
        debug!(provider = %provider_id, "Health check already running, skipping tick");
        return Ok(None);
    };

    let config = &inner.config.health;
    match health::probe(slot.executor.as_ref(), slot.registration.kind, config).await {
        Ok(report) => {
            debug!(
                provider = %provider_id,
                latency_ms = report.latency_ms,
                "Health check passed"
            );
            if let Some(capabilities) = report.capabilities {
                slot.set_capabilities(capabilities);
            }
            let transition = slot.health.record_success(Some(report.latency_ms));
            if slot.health.set_latency_degraded(report.latency_degraded) {
                warn!(
                    provider = %provider_id,
                    latency_ms = report.latency_ms,
                    threshold_ms = config.latency_threshold_ms,
                    "Health check latency above threshold"
                );
                inner.events.publish(OrchestratorEvent::LatencyDegraded {
                    provider_id: provider_id.clone(),
                    latency_ms: report.latency_ms,
                    threshold_ms: config.latency_threshold_ms,
                });
            }
            inner.publish_health(&slot, transition);
        },
        Err(error) => {
            warn!(provider = %provider_id, error = %error, "Health check failed");
            let transition = slot.health.record_failure(error.to_string());
            let circuit = if config.feeds_circuit_breaker {
                slot.circuit.record_failure()
            } else {
                None
            };
            inner.publish_circuit(provider_id, circuit);
            inner.publish_health(&slot, transition);
        },
    }

    Ok(Some(slot.health.snapshot()))
}

/// Spawn the periodic health check loop for one provider
///
/// The loop ends when the orchestrator is dropped or shut down, or the
/// provider is removed.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn spawn_health_loop(inner: Weak<Inner>, provider_id: ProviderId) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some((initial_delay, interval)) = inner
            .upgrade()
            .map(|i| (i.config.health.initial_delay(), i.config.health.interval()))
        else {
            return;
        };

        debug!(
            provider = %provider_id,
            initial_delay_ms = initial_delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Starting health check loop"
        );
        tokio::time::sleep(initial_delay).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.is_shut_down() {
                break;
            }
            if let Err(OrchestratorError::UnknownProvider(_)) =
                check_provider(&inner, &provider_id).await
            {
                break;
            }
        }
        debug!(provider = %provider_id, "Health check loop stopped");
    })
}

/// Spawn the periodic metrics export loop
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn spawn_metrics_export(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    info!(interval_ms = period.as_millis() as u64, "Starting metrics export");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.is_shut_down() {
                break;
            }
            let sink = inner.sink.read().clone();
            let snapshot = inner.metrics.snapshot();
            drop(inner);

            if let Err(e) = sink.export(&snapshot).await {
                warn!(error = %e, "Metrics export failed");
            }
        }
    })
}
