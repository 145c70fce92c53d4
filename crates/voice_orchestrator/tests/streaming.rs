//! Streaming synthesis and transcription through the orchestrator

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{id, orchestrator, quiet_config, register, registration};
use futures::{StreamExt, stream};
use voice_orchestrator::{
    CircuitPhase, ExclusionReason, ExhaustionReason, OrchestratorError, SelectionRequest,
    VoiceOrchestrator,
};
use voice_provider::testing::{ScriptedExecutor, Step};
use voice_provider::{
    AudioChunk, AudioInputStream, ProviderCapabilities, ProviderError, ProviderKind,
    SynthesisOptions, TranscriptionOptions, VoiceProviderExecutor,
};

fn microphone(chunks: u64) -> AudioInputStream {
    Box::pin(stream::iter((0..chunks).map(move |sequence| {
        let chunk = AudioChunk::new(sequence, vec![0u8; 320]);
        if sequence + 1 == chunks {
            chunk.into_final()
        } else {
            chunk
        }
    })))
}

async fn register_streaming(orch: &VoiceOrchestrator, name: &str, priority: u32) -> Arc<ScriptedExecutor> {
    let executor = Arc::new(ScriptedExecutor::new(name).with_capabilities(ProviderCapabilities {
        supports_streaming: true,
        ..ProviderCapabilities::default()
    }));
    let shared: Arc<dyn VoiceProviderExecutor> = executor.clone();
    orch.register(registration(name, ProviderKind::Stt, priority), shared)
        .await
        .unwrap();
    executor
}

// ============================================================================
// Streaming synthesis
// ============================================================================

mod synthesis_stream_tests {
    use super::*;

    #[tokio::test]
    async fn chunks_arrive_in_order() {
        let orch = orchestrator(quiet_config());
        register(&orch, registration("piper", ProviderKind::Tts, 1)).await;

        let outcome = orch
            .synthesize_stream(&SelectionRequest::new(), "Hallo Welt", &SynthesisOptions::default())
            .await
            .unwrap();
        let chunks: Vec<AudioChunk> = outcome
            .output
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(outcome.report.provider_id, id("piper"));
        let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(chunks[2].is_final);
        assert!(!chunks[0].is_final);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_before_first_chunk_falls_back() {
        let orch = orchestrator(quiet_config());
        let a = register(&orch, registration("a", ProviderKind::Tts, 1)).await;
        let b = register(&orch, registration("b", ProviderKind::Tts, 2)).await;
        // Opens cleanly, then drops before any audio
        a.set_default(Step::StreamFailAfter(0));

        let outcome = orch
            .synthesize_stream(&SelectionRequest::new(), "Hallo", &SynthesisOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.report.provider_id, id("b"));
        assert_eq!(outcome.report.switch_count, 1);
        assert_eq!(
            outcome.report.attempts[0].error.as_ref().map(ProviderError::code),
            Some("STREAM_INTERRUPTED".to_string())
        );
        assert_eq!(a.dispatch_count(), 3, "stream setup is retried like any dispatch");
        assert_eq!(b.dispatch_count(), 1);
        assert_eq!(outcome.output.count().await, 3);
    }

    #[tokio::test]
    async fn failure_after_first_chunk_ends_stream_and_is_recorded() {
        let orch = orchestrator(quiet_config());
        let a = register(&orch, registration("a", ProviderKind::Tts, 1)).await;
        let b = register(&orch, registration("b", ProviderKind::Tts, 2)).await;
        a.push(Step::StreamFailAfter(1));

        let outcome = orch
            .synthesize_stream(&SelectionRequest::new(), "Hallo", &SynthesisOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.report.provider_id, id("a"));

        let items: Vec<_> = outcome.output.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProviderError::StreamInterrupted(_))));
        assert_eq!(b.dispatch_count(), 0, "no fallback once audio has been delivered");

        let status = &orch.status()[0];
        assert_eq!(status.metrics.sample_count, 2);
        assert_eq!(status.metrics.success_count, 1);
        assert_eq!(status.circuit.failure_count, 1);
        assert_eq!(status.health.consecutive_failures, 1);
    }
}

// ============================================================================
// Streaming transcription
// ============================================================================

mod transcription_stream_tests {
    use super::*;

    #[tokio::test]
    async fn segments_follow_input_chunks() {
        let orch = orchestrator(quiet_config());
        register_streaming(&orch, "deepgram", 1).await;

        let outcome = orch
            .transcribe_stream(
                &SelectionRequest::new(),
                microphone(3),
                &TranscriptionOptions::default(),
            )
            .await
            .unwrap();
        let texts: Vec<String> = outcome
            .output
            .map(|segment| segment.unwrap().text)
            .collect()
            .await;

        assert_eq!(
            texts,
            vec![
                "transcript from deepgram #0",
                "transcript from deepgram #1",
                "transcript from deepgram #2",
            ]
        );
        assert_eq!(outcome.report.attempted, vec![id("deepgram")]);
        assert_eq!(outcome.report.switch_count, 0);
    }

    #[tokio::test]
    async fn providers_without_streaming_are_excluded() {
        let orch = orchestrator(quiet_config());
        let batch = register(&orch, registration("whisper", ProviderKind::Stt, 1)).await;

        let err = orch
            .transcribe_stream(
                &SelectionRequest::new(),
                microphone(2),
                &TranscriptionOptions::default(),
            )
            .await
            .map(drop)
            .unwrap_err();

        match err {
            OrchestratorError::NoHealthyProvider { excluded, .. } => {
                assert_eq!(
                    excluded[0].reason,
                    ExclusionReason::Incompatible {
                        detail: "streaming not supported".to_string()
                    }
                );
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(batch.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn consumed_input_is_not_offered_to_another_provider() {
        let orch = orchestrator(quiet_config());
        let a = register_streaming(&orch, "a", 1).await;
        let b = register_streaming(&orch, "b", 2).await;
        a.push(Step::Fail(ProviderError::ConnectionFailed("reset by peer".to_string())));

        let err = orch
            .transcribe_stream(
                &SelectionRequest::new(),
                microphone(2),
                &TranscriptionOptions::default(),
            )
            .await
            .map(drop)
            .unwrap_err();

        match &err {
            OrchestratorError::AllProvidersExhausted { reason, attempts, .. } => {
                assert_eq!(*reason, ExhaustionReason::InputNotReplayable);
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].provider_id, id("a"));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("input stream not replayable"));
        assert_eq!(a.dispatch_count(), 1);
        assert_eq!(b.dispatch_count(), 0);
        assert_eq!(orch.status()[0].circuit.failure_count, 1);
    }

    #[tokio::test]
    async fn stream_failing_before_first_segment_is_a_failure() {
        let orch = orchestrator(quiet_config());
        let a = register_streaming(&orch, "a", 1).await;
        let b = register_streaming(&orch, "b", 2).await;
        a.push(Step::StreamFailAfter(0));

        let err = orch
            .transcribe_stream(
                &SelectionRequest::new(),
                microphone(3),
                &TranscriptionOptions::default(),
            )
            .await
            .err()
            .unwrap();

        match &err {
            OrchestratorError::AllProvidersExhausted { reason, last_error, .. } => {
                assert_eq!(*reason, ExhaustionReason::InputNotReplayable);
                assert!(matches!(last_error, Some(ProviderError::StreamInterrupted(_))));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(b.dispatch_count(), 0);

        let status = &orch.status()[0];
        assert_eq!(status.metrics.sample_count, 1);
        assert_eq!(status.metrics.success_count, 0);
        assert_eq!(status.circuit.failure_count, 1);
        assert_eq!(status.health.consecutive_failures, 1);
        assert_eq!(status.health.consecutive_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_booked_at_the_first_segment() {
        let orch = orchestrator(quiet_config());
        let a = register_streaming(&orch, "a", 1).await;
        a.push(Step::StreamFailAfter(1));

        let outcome = orch
            .transcribe_stream(
                &SelectionRequest::new(),
                microphone(3),
                &TranscriptionOptions::default(),
            )
            .await
            .unwrap();
        let items: Vec<_> = outcome.output.collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProviderError::StreamInterrupted(_))));
        let status = &orch.status()[0];
        assert_eq!(status.metrics.sample_count, 2);
        assert_eq!(status.metrics.success_count, 1);
    }

    #[tokio::test]
    async fn open_circuit_is_skipped_before_input_is_consumed() {
        let orch = orchestrator(quiet_config());
        let a = register_streaming(&orch, "a", 1).await;
        register_streaming(&orch, "b", 2).await;
        let error = ProviderError::ServiceUnavailable("restarting".to_string());
        for _ in 0..5 {
            orch.record_failure(&id("a"), voice_provider::OperationKind::Stt, &error)
                .unwrap();
        }
        assert_eq!(orch.status()[0].circuit.phase, CircuitPhase::Open);

        let outcome = orch
            .transcribe_stream(
                &SelectionRequest::new(),
                microphone(1),
                &TranscriptionOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.report.provider_id, id("b"));
        assert_eq!(a.dispatch_count(), 0);
        assert_eq!(outcome.output.count().await, 1);
    }
}
