//! Operation entry points and per-candidate dispatch
//!
//! A candidate attempt acquires a circuit permit, runs the retry policy
//! inside the candidate's deadline, and settles the permit with the final
//! outcome. Metrics are recorded once per dispatch, retries included.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{Stream, StreamExt, future, stream};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};
use voice_provider::{
    AudioBuffer, AudioFormat, AudioInputStream, AudioStream, OperationKind, ProviderError, ProviderId,
    SynthesisOptions, TranscriptStream, TranscriptionOptions, TranscriptionResult,
    VoiceProviderExecutor,
};

use crate::error::{ExhaustionReason, OpenCircuit, OrchestratorError};
use crate::fallback::{
    AttemptOutcome, AttemptRecord, CandidateOutcome, FallbackExecutor, SessionReport,
    SkippedCandidate,
};
use crate::orchestrator::{Inner, OperationOutcome};
use crate::retry::with_retry;
use crate::selector::SelectionRequest;

type ResultStream<T> = Pin<Box<dyn Stream<Item = Result<T, ProviderError>> + Send>>;

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Fill format and language from the call options when the request leaves them open
fn synthesis_request(request: &SelectionRequest, options: &SynthesisOptions) -> SelectionRequest {
    let mut merged = request.clone();
    merged.format = merged.format.or(options.format);
    if merged.language.is_none() {
        merged.language.clone_from(&options.language);
    }
    merged
}

fn transcription_request(
    request: &SelectionRequest,
    format: Option<AudioFormat>,
    options: &TranscriptionOptions,
) -> SelectionRequest {
    let mut merged = request.clone();
    merged.format = merged.format.or(format);
    if merged.language.is_none() {
        merged.language.clone_from(&options.language);
    }
    merged
}

/// Request settings that can never be served are the caller's fault, not a provider's
fn check_request(request: &SelectionRequest) -> Result<(), OrchestratorError> {
    if request.timeout_ms == Some(0) {
        return Err(OrchestratorError::InvalidRequest(
            "timeout_ms must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

impl Inner {
    fn fallback(&self) -> FallbackExecutor<'_> {
        FallbackExecutor::new(&self.config.switching, &self.cooldowns, &self.events)
    }

    pub(crate) async fn synthesize(
        &self,
        request: &SelectionRequest,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<OperationOutcome<AudioBuffer>, OrchestratorError> {
        self.ensure_open()?;
        if text.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "text to synthesize is empty".to_string(),
            ));
        }
        check_request(request)?;

        let request = synthesis_request(request, options);
        let selection = self.plan(OperationKind::Tts, &request)?;
        let (output, report) = self
            .fallback()
            .run(
                OperationKind::Tts,
                selection.candidates,
                selection.degraded,
                |provider_id| {
                    self.dispatch(
                        OperationKind::Tts,
                        provider_id,
                        request.timeout_ms,
                        move |executor: Arc<dyn VoiceProviderExecutor>| async move {
                            executor.synthesize(text, options).await
                        },
                    )
                },
            )
            .await?;
        Ok(OperationOutcome { output, report })
    }

    pub(crate) async fn transcribe(
        &self,
        request: &SelectionRequest,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<OperationOutcome<TranscriptionResult>, OrchestratorError> {
        self.ensure_open()?;
        if audio.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "audio to transcribe is empty".to_string(),
            ));
        }
        check_request(request)?;

        let request = transcription_request(request, Some(audio.format()), options);
        let selection = self.plan(OperationKind::Stt, &request)?;
        let (output, report) = self
            .fallback()
            .run(
                OperationKind::Stt,
                selection.candidates,
                selection.degraded,
                |provider_id| {
                    self.dispatch(
                        OperationKind::Stt,
                        provider_id,
                        request.timeout_ms,
                        move |executor: Arc<dyn VoiceProviderExecutor>| async move {
                            executor.transcribe(audio, options).await
                        },
                    )
                },
            )
            .await?;
        Ok(OperationOutcome { output, report })
    }

    pub(crate) async fn synthesize_stream(
        self: Arc<Self>,
        request: &SelectionRequest,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<OperationOutcome<AudioStream>, OrchestratorError> {
        self.ensure_open()?;
        if text.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "text to synthesize is empty".to_string(),
            ));
        }
        check_request(request)?;

        let request = synthesis_request(request, options);
        let selection = self.plan(OperationKind::Tts, &request)?;
        let ((first, rest), report) = self
            .fallback()
            .run(
                OperationKind::Tts,
                selection.candidates,
                selection.degraded,
                |provider_id| {
                    self.dispatch(
                        OperationKind::Tts,
                        provider_id,
                        request.timeout_ms,
                        move |executor: Arc<dyn VoiceProviderExecutor>| async move {
                            let mut chunks = executor.synthesize_stream(text, options).await?;
                            match chunks.next().await {
                                Some(Ok(first)) => Ok((first, chunks)),
                                Some(Err(error)) => Err(error),
                                None => Err(ProviderError::StreamInterrupted(format!(
                                    "{} ended the stream before the first chunk",
                                    executor.name()
                                ))),
                            }
                        },
                    )
                },
            )
            .await?;

        let chunks: AudioStream = Box::pin(stream::once(future::ready(Ok(first))).chain(rest));
        let output = monitor_stream(
            Arc::downgrade(&self),
            report.provider_id.clone(),
            OperationKind::Tts,
            chunks,
        );
        Ok(OperationOutcome { output, report })
    }

    pub(crate) async fn transcribe_stream(
        self: Arc<Self>,
        request: &SelectionRequest,
        audio: AudioInputStream,
        options: &TranscriptionOptions,
    ) -> Result<OperationOutcome<TranscriptStream>, OrchestratorError> {
        self.ensure_open()?;
        check_request(request)?;
        let request = transcription_request(request, None, options).streaming();
        let selection = self.plan(OperationKind::Stt, &request)?;
        let started = Instant::now();
        let mut skipped = Vec::new();
        let mut open = Vec::new();

        for candidate in self.fallback().order(selection.candidates) {
            let provider_id = candidate.provider_id;
            let Some(slot) = self
                .registry
                .get(&provider_id)
                .filter(|slot| slot.is_enabled())
            else {
                skipped.push(SkippedCandidate {
                    provider_id,
                    reason: "no longer available".to_string(),
                });
                continue;
            };
            let permit = match slot.circuit.try_acquire() {
                Ok(permit) => permit,
                Err(refused) => {
                    open.push(OpenCircuit {
                        provider_id: provider_id.clone(),
                        retry_after: refused.retry_after,
                    });
                    skipped.push(SkippedCandidate {
                        provider_id,
                        reason: "circuit refused permit".to_string(),
                    });
                    continue;
                },
            };

            // The input is handed over here; no other candidate can be tried after this.
            // Success means the first segment arrived within the deadline.
            let _load = slot.begin_request();
            let deadline = slot.deadline(request.timeout_ms, self.config.default_timeout());
            let attempt_started = Instant::now();
            let executor = &slot.executor;
            let first_segment = async move {
                let mut segments = executor.transcribe_stream(audio, options).await?;
                match segments.next().await {
                    Some(Ok(first)) => Ok::<_, ProviderError>((first, segments)),
                    Some(Err(error)) => Err(error),
                    None => Err(ProviderError::StreamInterrupted(format!(
                        "{} ended the stream before the first segment",
                        executor.name()
                    ))),
                }
            };
            let result = timeout(deadline, first_segment)
                .await
                .unwrap_or_else(|_| Err(ProviderError::Timeout(duration_ms(deadline))));
            let latency = attempt_started.elapsed();

            let record = |outcome, error| AttemptRecord {
                provider_id: provider_id.clone(),
                dispatches: 1,
                outcome,
                error,
                elapsed_ms: duration_ms(latency),
            };

            return match result {
                Ok((first, rest)) => {
                    self.metrics
                        .record_success(&provider_id, OperationKind::Stt, latency);
                    let transition = permit.succeed();
                    self.report_success(&slot, latency, transition);
                    let report = SessionReport {
                        operation: OperationKind::Stt,
                        provider_id: provider_id.clone(),
                        attempted: vec![provider_id.clone()],
                        attempts: vec![record(AttemptOutcome::Succeeded, None)],
                        skipped,
                        switch_count: 0,
                        cooldowns_ms: Vec::new(),
                        degraded: selection.degraded,
                        elapsed_ms: duration_ms(started.elapsed()),
                    };
                    let segments: TranscriptStream =
                        Box::pin(stream::once(future::ready(Ok(first))).chain(rest));
                    let output = monitor_stream(
                        Arc::downgrade(&self),
                        provider_id,
                        OperationKind::Stt,
                        segments,
                    );
                    Ok(OperationOutcome { output, report })
                },
                Err(error) => {
                    self.metrics
                        .record_failure(&provider_id, OperationKind::Stt, latency, &error);
                    if error.is_permanent() {
                        permit.release();
                        Err(OrchestratorError::Rejected {
                            provider_id: provider_id.clone(),
                            attempts: vec![record(AttemptOutcome::Rejected, Some(error.clone()))],
                            source: error,
                        })
                    } else {
                        let transition = permit.fail();
                        self.report_failure(&slot, &error, transition);
                        warn!(
                            provider = %provider_id,
                            error = %error,
                            "Streaming transcription failed; input cannot be replayed"
                        );
                        Err(OrchestratorError::AllProvidersExhausted {
                            operation: OperationKind::Stt,
                            reason: ExhaustionReason::InputNotReplayable,
                            attempts: vec![record(AttemptOutcome::Failed, Some(error.clone()))],
                            last_error: Some(error),
                        })
                    }
                },
            };
        }

        if open.is_empty() {
            Err(OrchestratorError::AllProvidersExhausted {
                operation: OperationKind::Stt,
                reason: ExhaustionReason::NoCandidatesLeft,
                last_error: None,
                attempts: Vec::new(),
            })
        } else {
            Err(OrchestratorError::CircuitOpen {
                operation: OperationKind::Stt,
                providers: open,
            })
        }
    }

    /// One candidate attempt: permit, retries, deadline, bookkeeping
    async fn dispatch<T, F, Fut>(
        &self,
        operation: OperationKind,
        provider_id: ProviderId,
        request_timeout_ms: Option<u64>,
        call: F,
    ) -> CandidateOutcome<T>
    where
        T: Send,
        F: Fn(Arc<dyn VoiceProviderExecutor>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
    {
        let Some(slot) = self.registry.get(&provider_id) else {
            return CandidateOutcome::Unavailable;
        };
        if !slot.is_enabled() {
            return CandidateOutcome::Unavailable;
        }
        let permit = match slot.circuit.try_acquire() {
            Ok(permit) => permit,
            Err(refused) => {
                return CandidateOutcome::CircuitRefused {
                    retry_after: refused.retry_after,
                };
            },
        };

        let _load = slot.begin_request();
        let deadline = slot.deadline(request_timeout_ms, self.config.default_timeout());
        let retry = slot.retry_config(&self.config.retry);
        let dispatches = AtomicU32::new(0);
        let started = Instant::now();
        debug!(
            provider = %provider_id,
            operation = %operation,
            deadline_ms = duration_ms(deadline),
            trial = permit.is_trial(),
            "Dispatching"
        );

        let metrics = &self.metrics;
        let provider = &provider_id;
        let executor = &slot.executor;
        let call = &call;
        let counter = &dispatches;
        let attempt = with_retry(retry, || {
            counter.fetch_add(1, Ordering::SeqCst);
            let pending = call(Arc::clone(executor));
            async move {
                let began = Instant::now();
                let result = pending.await;
                match &result {
                    Ok(_) => metrics.record_success(provider, operation, began.elapsed()),
                    Err(error) => metrics.record_failure(provider, operation, began.elapsed(), error),
                }
                result
            }
        });

        let (result, attempts) = match timeout(deadline, attempt).await {
            Ok(retried) => (retried.result, retried.attempts),
            Err(_) => {
                let error = ProviderError::Timeout(duration_ms(deadline));
                metrics.record_failure(provider, operation, started.elapsed(), &error);
                warn!(
                    provider = %provider_id,
                    operation = %operation,
                    deadline_ms = duration_ms(deadline),
                    "Candidate deadline exceeded"
                );
                (Err(error), dispatches.load(Ordering::SeqCst))
            },
        };

        match result {
            Ok(value) => {
                let transition = permit.succeed();
                self.report_success(&slot, started.elapsed(), transition);
                CandidateOutcome::Succeeded {
                    value,
                    dispatches: attempts,
                }
            },
            Err(error) if error.is_permanent() => {
                permit.release();
                debug!(provider = %provider_id, error = %error, "Permanent provider error");
                CandidateOutcome::Rejected {
                    error,
                    dispatches: attempts,
                }
            },
            Err(error) => {
                let transition = permit.fail();
                self.report_failure(&slot, &error, transition);
                CandidateOutcome::Failed {
                    error,
                    dispatches: attempts,
                }
            },
        }
    }

    /// A stream failed after its first item
    fn report_stream_failure(
        &self,
        provider_id: &ProviderId,
        operation: OperationKind,
        error: &ProviderError,
    ) {
        let Some(slot) = self.registry.get(provider_id) else {
            return;
        };
        warn!(
            provider = %provider_id,
            operation = %operation,
            error = %error,
            "Stream failed mid-way"
        );
        self.metrics
            .record_failure(provider_id, operation, Duration::ZERO, error);
        let transition = slot.circuit.record_failure();
        self.report_failure(&slot, error, transition);
    }
}

/// Report the first error of a stream against its provider and end the stream there
fn monitor_stream<T: Send + 'static>(
    inner: Weak<Inner>,
    provider_id: ProviderId,
    operation: OperationKind,
    items: ResultStream<T>,
) -> ResultStream<T> {
    Box::pin(items.scan(false, move |failed, item| {
        if *failed {
            return future::ready(None);
        }
        if let Err(error) = &item {
            *failed = true;
            if let Some(inner) = inner.upgrade() {
                inner.report_stream_failure(&provider_id, operation, error);
            }
        }
        future::ready(Some(item))
    }))
}
