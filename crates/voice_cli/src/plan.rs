//! Static selection plans
//!
//! Ranks the providers declared in a configuration as a freshly started
//! orchestrator would: every circuit closed, health unknown, no capability
//! reports yet.

use std::fmt::Write;

use voice_orchestrator::selector::{self, CandidateView};
use voice_orchestrator::{OrchestratorConfig, OrchestratorError, Selection, SelectionRequest};
use voice_provider::OperationKind;

/// Rank declared providers for one operation
pub fn static_plan(
    config: &OrchestratorConfig,
    operation: OperationKind,
    request: &SelectionRequest,
) -> Result<Selection, OrchestratorError> {
    let views: Vec<CandidateView> = config.providers.iter().map(CandidateView::declared).collect();
    selector::select(
        operation,
        request,
        &config.selection,
        config.fallback_chains.for_operation(operation),
        &views,
    )
}

/// Human-readable rendering of a plan
pub fn render(config: &OrchestratorConfig, selection: &Selection) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "🧭 Plan for {}:", selection.operation);

    for (rank, candidate) in selection.candidates.iter().enumerate() {
        let detail = config
            .provider(&candidate.provider_id)
            .map(|p| format!("{}, {}", p.deployment_mode, p.kind))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "   {}. {} (priority {}, {detail})",
            rank + 1,
            candidate.provider_id,
            candidate.priority
        );
    }

    if !selection.excluded.is_empty() {
        let _ = writeln!(out, "🚫 Excluded:");
        for exclusion in &selection.excluded {
            let _ = writeln!(out, "   - {exclusion}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use voice_orchestrator::{FallbackChains, ProviderRegistration, SelectionStrategy};
    use voice_provider::{DeploymentMode, ProviderId, ProviderKind};

    use super::*;

    fn id(s: &str) -> ProviderId {
        ProviderId::parse(s).unwrap()
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            providers: vec![
                ProviderRegistration::new(id("deepgram"), ProviderKind::Stt, DeploymentMode::Cloud)
                    .with_priority(2)
                    .with_estimated_cost_per_month(20.0),
                ProviderRegistration::new(id("whisper"), ProviderKind::Stt, DeploymentMode::Docker)
                    .with_priority(1),
                ProviderRegistration::new(id("piper"), ProviderKind::Tts, DeploymentMode::System)
                    .with_priority(1),
                ProviderRegistration::new(id("azure"), ProviderKind::Both, DeploymentMode::Cloud)
                    .with_priority(3)
                    .with_enabled(false),
            ],
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn ranks_declared_providers_by_priority() {
        let selection = static_plan(&config(), OperationKind::Stt, &SelectionRequest::new()).unwrap();
        assert_eq!(selection.provider_ids(), vec![id("whisper"), id("deepgram")]);
        assert_eq!(selection.excluded.len(), 1);
        assert_eq!(selection.excluded[0].provider_id, id("azure"));
    }

    #[test]
    fn strategy_override_changes_order() {
        let request = SelectionRequest::new().with_strategy(SelectionStrategy::Cheap);
        let selection = static_plan(&config(), OperationKind::Stt, &request).unwrap();
        assert_eq!(selection.provider_ids(), vec![id("whisper"), id("deepgram")]);

        let mut config = config();
        config.providers[1] = config.providers[1].clone().with_estimated_cost_per_month(50.0);
        let selection = static_plan(&config, OperationKind::Stt, &request).unwrap();
        assert_eq!(selection.provider_ids(), vec![id("deepgram"), id("whisper")]);
    }

    #[test]
    fn chain_limits_candidates() {
        let config = OrchestratorConfig {
            fallback_chains: FallbackChains {
                stt: vec![id("deepgram")],
                tts: Vec::new(),
            },
            ..config()
        };
        let selection = static_plan(&config, OperationKind::Stt, &SelectionRequest::new()).unwrap();
        assert_eq!(selection.provider_ids(), vec![id("deepgram")]);
    }

    #[test]
    fn render_lists_ranks_and_exclusions() {
        let config = config();
        let selection = static_plan(&config, OperationKind::Tts, &SelectionRequest::new()).unwrap();
        let text = render(&config, &selection);
        assert!(text.contains("1. piper (priority 1, system, tts)"), "{text}");
        assert!(text.contains("- azure (disabled)"), "{text}");
    }

    #[test]
    fn empty_configuration_has_no_plan() {
        let result = static_plan(
            &OrchestratorConfig::default(),
            OperationKind::Tts,
            &SelectionRequest::new(),
        );
        assert!(matches!(result, Err(OrchestratorError::NoHealthyProvider { .. })));
    }
}
