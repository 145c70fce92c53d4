//! Scripted executor for tests
//!
//! [`ScriptedExecutor`] plays back a queue of [`Step`]s, one per dispatch
//! (`synthesize`, `transcribe` and both streaming variants), and records how
//! often and when it was called. Time-based steps use `tokio::time`, so tests
//! can run with a paused clock.
//!
//! # Example
//!
//! ```ignore
//! use voice_provider::testing::{ScriptedExecutor, Step};
//!
//! let executor = ScriptedExecutor::new("primary");
//! executor.push(Step::Fail(ProviderError::Timeout(100)));
//! executor.push(Step::Succeed);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::ports::VoiceProviderExecutor;
use crate::types::{
    AudioBuffer, AudioChunk, AudioFormat, AudioInputStream, AudioStream, ProviderCapabilities,
    SynthesisOptions, TranscriptSegment, TranscriptStream, TranscriptionOptions,
    TranscriptionResult,
};

/// Behaviour of a single dispatch
#[derive(Debug, Clone)]
pub enum Step {
    /// Return a result immediately
    Succeed,
    /// Return a result after the delay
    SucceedAfter(Duration),
    /// Fail immediately
    Fail(ProviderError),
    /// Fail after the delay
    FailAfter(Duration, ProviderError),
    /// Never complete
    Hang,
    /// Streaming only: yield this many chunks or segments, then fail
    StreamFailAfter(usize),
}

/// Executor double driven by a script of [`Step`]s
#[derive(Debug)]
pub struct ScriptedExecutor {
    name: String,
    capabilities: Mutex<ProviderCapabilities>,
    capabilities_error: Mutex<Option<ProviderError>>,
    initialize_error: Mutex<Option<ProviderError>>,
    healthy: AtomicBool,
    transcript: String,
    stream_chunks: u64,
    script: Mutex<VecDeque<Step>>,
    default_step: Mutex<Step>,
    dispatches: Mutex<Vec<Instant>>,
    initialize_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    health_probes: AtomicU32,
}

impl ScriptedExecutor {
    /// Create an executor that succeeds on every dispatch
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            transcript: format!("transcript from {name}"),
            name,
            capabilities: Mutex::new(ProviderCapabilities::default()),
            capabilities_error: Mutex::new(None),
            initialize_error: Mutex::new(None),
            healthy: AtomicBool::new(true),
            stream_chunks: 3,
            script: Mutex::new(VecDeque::new()),
            default_step: Mutex::new(Step::Succeed),
            dispatches: Mutex::new(Vec::new()),
            initialize_calls: AtomicU32::new(0),
            shutdown_calls: AtomicU32::new(0),
            health_probes: AtomicU32::new(0),
        }
    }

    /// Replace the reported capabilities
    #[must_use]
    pub fn with_capabilities(self, capabilities: ProviderCapabilities) -> Self {
        *self.capabilities.lock() = capabilities;
        self
    }

    /// Make `initialize()` fail
    #[must_use]
    pub fn with_initialize_error(self, error: ProviderError) -> Self {
        *self.initialize_error.lock() = Some(error);
        self
    }

    /// Number of chunks produced by a successful streaming synthesis
    #[must_use]
    pub const fn with_stream_chunks(mut self, chunks: u64) -> Self {
        self.stream_chunks = chunks;
        self
    }

    /// Queue one step
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    /// Queue the same step `count` times
    pub fn push_n(&self, step: &Step, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(step.clone());
        }
    }

    /// Step used once the script is empty
    pub fn set_default(&self, step: Step) {
        *self.default_step.lock() = step;
    }

    /// Toggle the `is_healthy()` answer
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make `capabilities()` fail (or succeed again with `None`)
    pub fn set_capabilities_error(&self, error: Option<ProviderError>) {
        *self.capabilities_error.lock() = error;
    }

    /// Number of synthesize/transcribe dispatches so far
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().len()
    }

    /// When each dispatch started
    #[must_use]
    pub fn dispatch_instants(&self) -> Vec<Instant> {
        self.dispatches.lock().clone()
    }

    /// Number of `initialize()` calls
    #[must_use]
    pub fn initialize_count(&self) -> u32 {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Number of `shutdown()` calls
    #[must_use]
    pub fn shutdown_count(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Number of `is_healthy()` calls
    #[must_use]
    pub fn health_probe_count(&self) -> u32 {
        self.health_probes.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.dispatches.lock().push(Instant::now());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_step.lock().clone())
    }

    /// Play a step; `Ok(Some(n))` means "stream n chunks then fail"
    async fn play(step: Step) -> Result<Option<usize>, ProviderError> {
        match step {
            Step::Succeed => Ok(None),
            Step::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            },
            Step::Fail(error) => Err(error),
            Step::FailAfter(delay, error) => {
                tokio::time::sleep(delay).await;
                Err(error)
            },
            Step::Hang => std::future::pending().await,
            Step::StreamFailAfter(chunks) => Ok(Some(chunks)),
        }
    }
}

#[async_trait]
impl VoiceProviderExecutor for ScriptedExecutor {
    async fn initialize(&self) -> Result<(), ProviderError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        match self.initialize_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn capabilities(&self) -> Result<ProviderCapabilities, ProviderError> {
        if let Some(error) = self.capabilities_error.lock().clone() {
            return Err(error);
        }
        Ok(self.capabilities.lock().clone())
    }

    async fn is_healthy(&self) -> bool {
        self.health_probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }

    async fn synthesize(
        &self,
        text: &str,
        _options: &SynthesisOptions,
    ) -> Result<AudioBuffer, ProviderError> {
        let step = self.next_step();
        Self::play(step).await?;
        Ok(AudioBuffer::new(
            text.as_bytes().to_vec(),
            AudioFormat::Pcm16,
            16_000,
        ))
    }

    async fn transcribe(
        &self,
        _audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResult, ProviderError> {
        let step = self.next_step();
        Self::play(step).await?;
        let mut result = TranscriptionResult::new(self.transcript.clone());
        if let Some(language) = &options.language {
            result = result.with_language(language.clone());
        }
        Ok(result)
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        _options: &SynthesisOptions,
    ) -> Result<AudioStream, ProviderError> {
        let step = self.next_step();
        let fail_after = Self::play(step).await?;
        let total = self.stream_chunks;
        let payload = text.as_bytes().to_vec();

        let chunks = (0..total).map(move |sequence| {
            let chunk = AudioChunk::new(sequence, payload.clone());
            Ok(if sequence + 1 == total {
                chunk.into_final()
            } else {
                chunk
            })
        });

        match fail_after {
            None => Ok(Box::pin(stream::iter(chunks))),
            Some(good) => {
                let failure = ProviderError::StreamInterrupted(format!(
                    "{} dropped the connection",
                    self.name
                ));
                Ok(Box::pin(
                    stream::iter(chunks.take(good)).chain(stream::once(async move { Err(failure) })),
                ))
            },
        }
    }

    async fn transcribe_stream(
        &self,
        audio: AudioInputStream,
        _options: &TranscriptionOptions,
    ) -> Result<TranscriptStream, ProviderError> {
        let step = self.next_step();
        let fail_after = Self::play(step).await?;
        let transcript = self.transcript.clone();
        let segments = audio.map(move |chunk| {
            Ok(TranscriptSegment {
                text: format!("{transcript} #{}", chunk.sequence),
                is_final: chunk.is_final,
                confidence: Some(0.9),
            })
        });

        match fail_after {
            None => Ok(Box::pin(segments)),
            Some(good) => {
                let failure = ProviderError::StreamInterrupted(format!(
                    "{} lost the audio session",
                    self.name
                ));
                Ok(Box::pin(
                    segments.take(good).chain(stream::once(async move { Err(failure) })),
                ))
            },
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
