//! Types for voice provider executors
//!
//! Contains audio buffers and chunks, synthesis/transcription options and
//! results, capability reports, and the classification enums shared between
//! executors and the orchestrator.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Operation a caller asks the orchestrator to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Speech-to-text
    Stt,
    /// Text-to-speech
    Tts,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stt => write!(f, "stt"),
            Self::Tts => write!(f, "tts"),
        }
    }
}

/// Which operations a provider can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Speech-to-text only
    Stt,
    /// Text-to-speech only
    Tts,
    /// Both directions
    Both,
}

impl ProviderKind {
    /// Returns true if this provider can serve the given operation
    #[must_use]
    pub const fn supports(self, operation: OperationKind) -> bool {
        matches!(
            (self, operation),
            (Self::Both, _) | (Self::Stt, OperationKind::Stt) | (Self::Tts, OperationKind::Tts)
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stt => write!(f, "stt"),
            Self::Tts => write!(f, "tts"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Where a provider runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Model server in a local container
    Docker,
    /// Local binary or subprocess
    System,
    /// Remote API
    Cloud,
}

impl DeploymentMode {
    /// Returns true for providers running on this machine
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Docker | Self::System)
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::System => write!(f, "system"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// Supported audio formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw signed 16-bit little-endian PCM
    Pcm16,
    /// WAV container (uncompressed)
    Wav,
    /// MP3
    Mp3,
    /// Opus codec
    Opus,
    /// OGG container
    Ogg,
    /// FLAC (lossless)
    Flac,
    /// WebM container
    Webm,
    /// 8-bit mu-law (telephony)
    Mulaw,
}

impl AudioFormat {
    /// Get the MIME type for this audio format
    #[must_use]
    pub const fn mime_type(&self) -> &'static str {
        match self {
            Self::Pcm16 => "audio/pcm",
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Opus => "audio/opus",
            Self::Ogg => "audio/ogg",
            Self::Flac => "audio/flac",
            Self::Webm => "audio/webm",
            Self::Mulaw => "audio/basic",
        }
    }

    /// Get the file extension for this audio format
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm",
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Webm => "webm",
            Self::Mulaw => "ulaw",
        }
    }
}

/// Complete audio payload with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    data: Bytes,
    format: AudioFormat,
    sample_rate: u32,
    channels: u16,
    duration_ms: Option<u64>,
}

impl AudioBuffer {
    /// Create a new mono audio buffer
    #[must_use]
    pub fn new(data: impl Into<Bytes>, format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            format,
            sample_rate,
            channels: 1,
            duration_ms: None,
        }
    }

    /// Create `duration_ms` of mono PCM16 silence
    ///
    /// Used as a cheap transcription probe.
    #[must_use]
    pub fn silence(sample_rate: u32, duration_ms: u64) -> Self {
        let samples = u64::from(sample_rate) * duration_ms / 1000;
        let len = usize::try_from(samples * 2).unwrap_or(0);
        Self::new(vec![0u8; len], AudioFormat::Pcm16, sample_rate).with_duration(duration_ms)
    }

    /// Set the channel count
    #[must_use]
    pub const fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Set the duration in milliseconds
    #[must_use]
    pub const fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Get the raw audio bytes
    #[must_use]
    pub const fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume and return the raw audio bytes
    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Get the audio format
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    /// Get the sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get the channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Get the duration in milliseconds (if known)
    #[must_use]
    pub const fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Check if the buffer holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the payload in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// One piece of a streamed audio payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Position in the stream, starting at 0
    pub sequence: u64,
    /// Audio bytes of this chunk
    pub data: Bytes,
    /// True for the last chunk of the utterance
    pub is_final: bool,
}

impl AudioChunk {
    /// Create a non-final chunk
    #[must_use]
    pub fn new(sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
            is_final: false,
        }
    }

    /// Mark this chunk as the last one
    #[must_use]
    pub const fn into_final(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Options for text-to-speech
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    /// Voice identifier (provider default if unset)
    #[serde(default)]
    pub voice: Option<String>,
    /// Requested output format
    #[serde(default)]
    pub format: Option<AudioFormat>,
    /// Requested output sample rate in Hz
    #[serde(default)]
    pub sample_rate: Option<u32>,
    /// Language of the text (BCP 47)
    #[serde(default)]
    pub language: Option<String>,
    /// Speaking rate multiplier
    #[serde(default)]
    pub speed: Option<f32>,
}

/// Options for speech-to-text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionOptions {
    /// Expected spoken language (BCP 47)
    #[serde(default)]
    pub language: Option<String>,
    /// Vocabulary or context hint
    #[serde(default)]
    pub prompt: Option<String>,
    /// Request word-level timestamps
    #[serde(default)]
    pub word_timestamps: bool,
}

/// Word-level timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    /// The word
    pub word: String,
    /// Start time in milliseconds
    pub start_ms: u64,
    /// End time in milliseconds
    pub end_ms: u64,
}

/// Result of speech-to-text transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    /// Transcribed text
    pub text: String,
    /// Detected language
    pub language: Option<String>,
    /// Confidence score (0.0 - 1.0)
    pub confidence: Option<f32>,
    /// Duration of the audio in milliseconds
    pub duration_ms: Option<u64>,
    /// Word-level timestamps (if requested and available)
    pub words: Option<Vec<WordTimestamp>>,
}

impl TranscriptionResult {
    /// Create a transcription with just text
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: None,
            confidence: None,
            duration_ms: None,
            words: None,
        }
    }

    /// Set the detected language
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the confidence score
    #[must_use]
    pub const fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Incremental transcript produced by a streaming transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Text recognised so far for this segment
    pub text: String,
    /// True once the segment will no longer change
    pub is_final: bool,
    /// Confidence score (0.0 - 1.0)
    pub confidence: Option<f32>,
}

/// What a provider reports it can do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Audio formats accepted (STT) or produced (TTS)
    pub supported_formats: Vec<AudioFormat>,
    /// Sample rates in Hz
    pub supported_sample_rates: Vec<u32>,
    /// Language tags; empty means any language
    pub supported_languages: Vec<String>,
    /// Whether the streaming variants are implemented
    pub supports_streaming: bool,
    /// Concurrent sessions the backend tolerates
    pub max_concurrent_sessions: u32,
    /// Typical latency in milliseconds
    pub estimated_latency_ms: Option<u64>,
    /// Whether the provider needs internet access
    pub requires_network_connection: bool,
    /// Whether the provider needs a downloaded model
    pub requires_local_model: Option<bool>,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supported_formats: vec![AudioFormat::Wav],
            supported_sample_rates: vec![16_000],
            supported_languages: Vec::new(),
            supports_streaming: false,
            max_concurrent_sessions: 1,
            estimated_latency_ms: None,
            requires_network_connection: false,
            requires_local_model: None,
        }
    }
}

impl ProviderCapabilities {
    /// Returns true if the format is listed (an empty list accepts anything)
    #[must_use]
    pub fn supports_format(&self, format: AudioFormat) -> bool {
        self.supported_formats.is_empty() || self.supported_formats.contains(&format)
    }

    /// Returns true if the language is supported
    ///
    /// Matches either the full tag or its primary subtag, so `en-US`
    /// is accepted by a provider listing `en`.
    #[must_use]
    pub fn supports_language(&self, language: &str) -> bool {
        if self.supported_languages.is_empty() {
            return true;
        }
        let primary = language.split(['-', '_']).next().unwrap_or(language);
        self.supported_languages.iter().any(|supported| {
            supported.eq_ignore_ascii_case(language) || supported.eq_ignore_ascii_case(primary)
        })
    }
}

/// Streamed synthesis output
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<AudioChunk, ProviderError>> + Send>>;

/// Streamed transcription input
pub type AudioInputStream = Pin<Box<dyn Stream<Item = AudioChunk> + Send>>;

/// Streamed transcription output
pub type TranscriptStream =
    Pin<Box<dyn Stream<Item = Result<TranscriptSegment, ProviderError>> + Send>>;
