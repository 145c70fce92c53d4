//! Provider executor errors
//!
//! Every executor reports failures through [`ProviderError`]. The orchestrator
//! never inspects executor internals, so the variant alone must tell it
//! whether a failure is worth retrying, worth switching providers for, or
//! is the caller's fault.

use thiserror::Error;

/// How the orchestrator should react to a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup, timeout, overload: retry locally, then fall back
    Transient,
    /// The provider itself is broken for this call: no retry, but another
    /// provider may succeed
    ProviderFault,
    /// The request can never succeed: no retry, no fallback
    Permanent,
}

/// Errors that can occur inside a provider executor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Executor was used before `initialize()` succeeded
    #[error("Provider not initialized: {0}")]
    NotInitialized(String),

    /// Request payload is unusable (empty text, corrupt audio, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation, format or option not supported by this provider
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Synthesis failed inside the provider
    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Transcription failed inside the provider
    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    /// Backend answered with an HTTP error status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Could not reach the backend
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation did not complete in time
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Backend is throttling requests
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Backend is temporarily unavailable (maintenance, container restart)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Executor is misconfigured (missing key, bad model path)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stream ended or failed before it was complete
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ProviderError {
    /// Build an error from an HTTP status returned by a provider backend
    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited,
            503 => Self::ServiceUnavailable(message),
            _ => Self::Http { status, message },
        }
    }

    /// Classify this error for retry and fallback decisions
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidInput(_) | Self::NotSupported(_) => ErrorClass::Permanent,
            Self::ConnectionFailed(_)
            | Self::Timeout(_)
            | Self::RateLimited
            | Self::ServiceUnavailable(_)
            | Self::StreamInterrupted(_) => ErrorClass::Transient,
            Self::Http { status, .. } => {
                if *status >= 500 || *status == 408 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::ProviderFault
                }
            },
            Self::NotInitialized(_)
            | Self::SynthesisFailed(_)
            | Self::TranscriptionFailed(_)
            | Self::Configuration(_) => ErrorClass::ProviderFault,
        }
    }

    /// Returns true if retrying against the same provider may help
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Returns true if neither retrying nor switching providers can help
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.class(), ErrorClass::Permanent)
    }

    /// Stable, machine-readable error kind
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::NotInitialized(_) => "NOT_INITIALIZED".to_string(),
            Self::InvalidInput(_) => "INVALID_INPUT".to_string(),
            Self::NotSupported(_) => "NOT_SUPPORTED".to_string(),
            Self::SynthesisFailed(_) => "SYNTHESIS_FAILED".to_string(),
            Self::TranscriptionFailed(_) => "TRANSCRIPTION_FAILED".to_string(),
            Self::Http { status, .. } => format!("HTTP_{status}"),
            Self::ConnectionFailed(_) => "CONNECTION_FAILED".to_string(),
            Self::Timeout(_) => "TIMEOUT".to_string(),
            Self::RateLimited => "RATE_LIMITED".to_string(),
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE".to_string(),
            Self::Configuration(_) => "CONFIGURATION".to_string(),
            Self::StreamInterrupted(_) => "STREAM_INTERRUPTED".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_message() {
        let err = ProviderError::Http {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 502: bad gateway");
    }

    #[test]
    fn timeout_error_message() {
        let err = ProviderError::Timeout(2000);
        assert_eq!(err.to_string(), "Operation timed out after 2000ms");
    }

    #[test]
    fn from_http_status_maps_throttling_and_unavailable() {
        assert_eq!(
            ProviderError::from_http_status(429, "slow down"),
            ProviderError::RateLimited
        );
        assert_eq!(
            ProviderError::from_http_status(503, "maintenance"),
            ProviderError::ServiceUnavailable("maintenance".to_string())
        );
        assert_eq!(
            ProviderError::from_http_status(401, "unauthorized").code(),
            "HTTP_401"
        );
    }

    #[test]
    fn validation_and_unsupported_are_permanent() {
        assert!(ProviderError::InvalidInput("empty text".to_string()).is_permanent());
        assert!(ProviderError::NotSupported("streaming".to_string()).is_permanent());
    }

    #[test]
    fn network_kinds_are_transient() {
        assert!(ProviderError::ConnectionFailed("refused".to_string()).is_transient());
        assert!(ProviderError::Timeout(100).is_transient());
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::from_http_status(500, "boom").is_transient());
        assert!(ProviderError::from_http_status(408, "request timeout").is_transient());
    }

    #[test]
    fn provider_faults_are_neither_transient_nor_permanent() {
        let errors = [
            ProviderError::NotInitialized("model not loaded".to_string()),
            ProviderError::SynthesisFailed("vocoder crashed".to_string()),
            ProviderError::from_http_status(403, "forbidden"),
        ];
        for err in errors {
            assert_eq!(err.class(), ErrorClass::ProviderFault, "{err}");
            assert!(!err.is_transient());
            assert!(!err.is_permanent());
        }
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ProviderError::NotInitialized(String::new()).code(),
            "NOT_INITIALIZED"
        );
        assert_eq!(
            ProviderError::TranscriptionFailed(String::new()).code(),
            "TRANSCRIPTION_FAILED"
        );
        assert_eq!(ProviderError::RateLimited.code(), "RATE_LIMITED");
    }
}
