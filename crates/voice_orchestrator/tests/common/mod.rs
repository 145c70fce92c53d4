//! Shared fixtures for the orchestrator integration tests

#![allow(dead_code, clippy::expect_used)]

use std::sync::Arc;

use voice_orchestrator::{
    HealthConfig, OrchestratorConfig, OrchestratorEvent, ProviderRegistration, VoiceOrchestrator,
};
use voice_provider::testing::ScriptedExecutor;
use voice_provider::{
    AudioBuffer, AudioFormat, DeploymentMode, ProviderId, ProviderKind, VoiceProviderExecutor,
};

pub fn id(s: &str) -> ProviderId {
    ProviderId::parse(s).expect("valid provider id")
}

/// Defaults with periodic health checks switched off
pub fn quiet_config() -> OrchestratorConfig {
    OrchestratorConfig {
        health: HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator(config: OrchestratorConfig) -> VoiceOrchestrator {
    VoiceOrchestrator::new(config).expect("valid configuration")
}

pub fn registration(name: &str, kind: ProviderKind, priority: u32) -> ProviderRegistration {
    ProviderRegistration::new(id(name), kind, DeploymentMode::Cloud).with_priority(priority)
}

/// Register a scripted executor and hand it back for scripting
pub async fn register(
    orchestrator: &VoiceOrchestrator,
    registration: ProviderRegistration,
) -> Arc<ScriptedExecutor> {
    let executor = Arc::new(ScriptedExecutor::new(registration.id.as_str()));
    let shared: Arc<dyn VoiceProviderExecutor> = executor.clone();
    orchestrator
        .register(registration, shared)
        .await
        .expect("registration succeeds");
    executor
}

pub fn speech() -> AudioBuffer {
    AudioBuffer::new(vec![1u8, 2, 3, 4], AudioFormat::Wav, 16_000)
}

/// Events received so far, without waiting
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
