//! Voice Provider - capability contract for speech backends
//!
//! Defines what every speech-to-text (STT) and text-to-speech (TTS) backend
//! must offer so an orchestrator can drive cloud APIs, container-hosted model
//! servers and local subprocess models interchangeably:
//! - `VoiceProviderExecutor` - the async executor trait (port)
//! - `ProviderError` - failure taxonomy with retry/fallback classification
//! - audio, option, result and capability types
//!
//! Concrete adapters live outside this crate.
//!
//! # Example
//!
//! ```ignore
//! use voice_provider::{VoiceProviderExecutor, TranscriptionOptions};
//!
//! let result = executor.transcribe(&audio, &TranscriptionOptions::default()).await?;
//! println!("Transcribed: {}", result.text);
//! ```

pub mod error;
pub mod ports;
pub mod provider_id;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use error::{ErrorClass, ProviderError};
pub use ports::VoiceProviderExecutor;
pub use provider_id::{InvalidProviderId, MAX_PROVIDER_ID_LEN, ProviderId};
pub use types::{
    AudioBuffer, AudioChunk, AudioFormat, AudioInputStream, AudioStream, DeploymentMode,
    OperationKind, ProviderCapabilities, ProviderKind, SynthesisOptions, TranscriptSegment,
    TranscriptStream, TranscriptionOptions, TranscriptionResult, WordTimestamp,
};
