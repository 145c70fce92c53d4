//! Port definitions for provider executors
//!
//! Defines the single capability contract every STT/TTS backend adapter
//! implements so the orchestrator can drive it without knowing whether it
//! talks to a cloud API, a container, or a local subprocess.

use async_trait::async_trait;
use futures::stream;

use crate::error::ProviderError;
use crate::types::{
    AudioBuffer, AudioChunk, AudioInputStream, AudioStream, ProviderCapabilities,
    SynthesisOptions, TranscriptStream, TranscriptionOptions, TranscriptionResult,
};

/// Contract for a speech provider backend
///
/// A single trait covers both directions; executors that only implement one
/// of them return [`ProviderError::NotSupported`] for the other, and the
/// orchestrator only routes operations matching the registered provider kind.
///
/// # Example
///
/// ```ignore
/// use voice_provider::{VoiceProviderExecutor, SynthesisOptions};
///
/// async fn say_hello(tts: &dyn VoiceProviderExecutor) -> Result<usize, ProviderError> {
///     tts.initialize().await?;
///     let audio = tts.synthesize("Hello", &SynthesisOptions::default()).await?;
///     Ok(audio.len())
/// }
/// ```
#[async_trait]
pub trait VoiceProviderExecutor: Send + Sync {
    /// Establish readiness (auth check, connection warm-up, model load)
    ///
    /// Called once by the orchestrator when the provider is registered.
    async fn initialize(&self) -> Result<(), ProviderError>;

    /// Release resources
    ///
    /// Must be idempotent: repeated calls are harmless.
    async fn shutdown(&self);

    /// Report what this provider supports
    async fn capabilities(&self) -> Result<ProviderCapabilities, ProviderError>;

    /// Cheap liveness signal
    async fn is_healthy(&self) -> bool;

    /// Convert text to speech
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<AudioBuffer, ProviderError>;

    /// Convert speech to text
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        options: &TranscriptionOptions,
    ) -> Result<TranscriptionResult, ProviderError>;

    /// Convert text to a stream of audio chunks
    ///
    /// The default implementation wraps [`synthesize`](Self::synthesize)
    /// into a single final chunk.
    async fn synthesize_stream(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<AudioStream, ProviderError> {
        let audio = self.synthesize(text, options).await?;
        let chunk = AudioChunk::new(0, audio.into_data()).into_final();
        Ok(Box::pin(stream::once(async move { Ok(chunk) })))
    }

    /// Convert a stream of audio chunks to incremental transcripts
    async fn transcribe_stream(
        &self,
        _audio: AudioInputStream,
        _options: &TranscriptionOptions,
    ) -> Result<TranscriptStream, ProviderError> {
        Err(ProviderError::NotSupported(format!(
            "{} does not support streaming transcription",
            self.name()
        )))
    }

    /// Human-readable backend name (model or service)
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::types::AudioFormat;

    /// Minimal TTS-only executor relying on the default streaming methods
    struct EchoTts;

    #[async_trait]
    impl VoiceProviderExecutor for EchoTts {
        async fn initialize(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn shutdown(&self) {}

        async fn capabilities(&self) -> Result<ProviderCapabilities, ProviderError> {
            Ok(ProviderCapabilities::default())
        }

        async fn is_healthy(&self) -> bool {
            true
        }

        async fn synthesize(
            &self,
            text: &str,
            _options: &SynthesisOptions,
        ) -> Result<AudioBuffer, ProviderError> {
            if text.is_empty() {
                return Err(ProviderError::InvalidInput("empty text".to_string()));
            }
            Ok(AudioBuffer::new(text.as_bytes().to_vec(), AudioFormat::Pcm16, 16_000))
        }

        async fn transcribe(
            &self,
            _audio: &AudioBuffer,
            _options: &TranscriptionOptions,
        ) -> Result<TranscriptionResult, ProviderError> {
            Err(ProviderError::NotSupported("tts only".to_string()))
        }

        fn name(&self) -> &str {
            "echo-tts"
        }
    }

    #[tokio::test]
    async fn default_stream_yields_single_final_chunk() {
        let tts = EchoTts;
        let mut stream = tts
            .synthesize_stream("abc", &SynthesisOptions::default())
            .await
            .unwrap();

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.sequence, 0);
        assert!(chunk.is_final);
        assert_eq!(chunk.data.as_ref(), b"abc");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn default_stream_propagates_synthesis_error() {
        let tts = EchoTts;
        let result = tts.synthesize_stream("", &SynthesisOptions::default()).await;
        assert!(matches!(result, Err(ProviderError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn default_transcribe_stream_is_not_supported() {
        let tts = EchoTts;
        let input: AudioInputStream = Box::pin(stream::empty());
        let result = tts
            .transcribe_stream(input, &TranscriptionOptions::default())
            .await;
        match result {
            Err(ProviderError::NotSupported(msg)) => assert!(msg.contains("echo-tts")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected NotSupported"),
        }
    }
}
