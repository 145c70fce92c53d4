//! Provider health monitoring
//!
//! Each provider carries a [`HealthTracker`] with hysteresis: it only turns
//! unhealthy once `unhealthy_threshold` consecutive checks failed, and only
//! recovers after `healthy_threshold` consecutive successes. Checks are
//! built from [`HealthCheckStrategy`] steps and bounded by `timeout_ms`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};
use voice_provider::{
    AudioBuffer, OperationKind, ProviderCapabilities, ProviderError, ProviderKind,
    SynthesisOptions, TranscriptionOptions, VoiceProviderExecutor,
};

use crate::error::ConfigError;

/// Text synthesized by echo probes
const ECHO_TEXT: &str = "ok";
/// Text synthesized by round-trip probes
const ROUND_TRIP_TEXT: &str = "health check";
/// Silent audio used to probe speech-to-text providers
const PROBE_SAMPLE_RATE: u32 = 16_000;
const PROBE_DURATION_MS: u64 = 100;

/// One step of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckStrategy {
    /// Capability report plus `is_healthy()`
    Metadata,
    /// Trivial synthesis, or a short silent transcription for STT-only providers
    Echo,
    /// Flag the provider as slow when the check exceeds `latency_threshold_ms`
    Latency,
    /// Production-shaped call with non-empty output required
    FullRoundTrip,
}

/// Health monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Run periodic checks at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between checks in milliseconds (default: 60000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Delay before the first check in milliseconds (default: 5000)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Bound for a whole check in milliseconds (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive successes to become healthy (default: 2)
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures to become unhealthy (default: 3)
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Probe latency above which a provider is flagged slow (default: 3000)
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Steps run in order by every check
    #[serde(default = "default_strategies")]
    pub strategies: Vec<HealthCheckStrategy>,

    /// Count failed checks against the provider's circuit breaker
    #[serde(default = "default_true")]
    pub feeds_circuit_breaker: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_interval_ms() -> u64 {
    60_000
}

const fn default_initial_delay_ms() -> u64 {
    5_000
}

const fn default_timeout_ms() -> u64 {
    5_000
}

const fn default_healthy_threshold() -> u32 {
    2
}

const fn default_unhealthy_threshold() -> u32 {
    3
}

const fn default_latency_threshold_ms() -> u64 {
    3_000
}

fn default_strategies() -> Vec<HealthCheckStrategy> {
    vec![HealthCheckStrategy::Metadata, HealthCheckStrategy::Latency]
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            timeout_ms: default_timeout_ms(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            strategies: default_strategies(),
            feeds_circuit_breaker: default_true(),
        }
    }
}

impl HealthConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid(
                "health.interval_ms",
                "must be greater than 0",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "health.timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.healthy_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.healthy_threshold",
                "must be greater than 0",
            ));
        }
        if self.unhealthy_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.unhealthy_threshold",
                "must be greater than 0",
            ));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::invalid(
                "health.strategies",
                "at least one strategy is required",
            ));
        }
        Ok(())
    }

    /// Delay before the first check
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Interval between checks
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Bound for one check
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Coarse health of a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Passed `healthy_threshold` consecutive checks
    Healthy,
    /// Failed `unhealthy_threshold` consecutive checks
    Unhealthy,
    /// Not enough evidence yet
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health state of one provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthState {
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Current status
    pub status: HealthStatus,
    /// When the provider was last checked or used
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Latency of the last successful check or call
    pub last_latency_ms: Option<u64>,
    /// Last probe exceeded `latency_threshold_ms`
    pub latency_degraded: bool,
    /// Message of the last failure
    pub last_error: Option<String>,
}

/// A status flip reported by [`HealthTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// Reached `unhealthy_threshold`
    Degraded {
        /// Failures counted at the flip
        consecutive_failures: u32,
    },
    /// Reached `healthy_threshold`
    Recovered {
        /// Successes counted at the flip
        consecutive_successes: u32,
    },
}

/// Hysteresis state machine for one provider
#[derive(Debug)]
pub struct HealthTracker {
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    state: RwLock<HealthState>,
}

impl HealthTracker {
    /// Create a tracker in the `unknown` state
    #[must_use]
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            healthy_threshold: config.healthy_threshold,
            unhealthy_threshold: config.unhealthy_threshold,
            state: RwLock::new(HealthState::default()),
        }
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> HealthState {
        self.state.read().clone()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.state.read().status
    }

    /// Record a successful check or call
    pub fn record_success(&self, latency_ms: Option<u64>) -> Option<HealthTransition> {
        let mut state = self.state.write();
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.consecutive_failures = 0;
        state.last_checked_at = Some(Utc::now());
        if latency_ms.is_some() {
            state.last_latency_ms = latency_ms;
        }

        if state.consecutive_successes == self.healthy_threshold
            && state.status != HealthStatus::Healthy
        {
            state.status = HealthStatus::Healthy;
            return Some(HealthTransition::Recovered {
                consecutive_successes: state.consecutive_successes,
            });
        }
        None
    }

    /// Record a failed check or call
    pub fn record_failure(&self, error: impl Into<String>) -> Option<HealthTransition> {
        let mut state = self.state.write();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.consecutive_successes = 0;
        state.last_checked_at = Some(Utc::now());
        state.last_error = Some(error.into());

        if state.consecutive_failures == self.unhealthy_threshold
            && state.status != HealthStatus::Unhealthy
        {
            state.status = HealthStatus::Unhealthy;
            return Some(HealthTransition::Degraded {
                consecutive_failures: state.consecutive_failures,
            });
        }
        None
    }

    /// Set the latency flag, returning true when it was newly raised
    pub fn set_latency_degraded(&self, degraded: bool) -> bool {
        let mut state = self.state.write();
        let newly = degraded && !state.latency_degraded;
        state.latency_degraded = degraded;
        newly
    }
}

/// What a passed health check measured
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// Duration of the whole check
    pub latency_ms: u64,
    /// The check exceeded `latency_threshold_ms` (only set by the latency step)
    pub latency_degraded: bool,
    /// Fresh capability report from a metadata step
    pub capabilities: Option<ProviderCapabilities>,
}

/// Run a full health check against one executor
///
/// Any step error, or exceeding `timeout_ms`, fails the check.
pub async fn probe(
    executor: &dyn VoiceProviderExecutor,
    kind: ProviderKind,
    config: &HealthConfig,
) -> Result<ProbeReport, ProviderError> {
    match timeout(config.timeout(), run_strategies(executor, kind, config)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(config.timeout_ms)),
    }
}

async fn run_strategies(
    executor: &dyn VoiceProviderExecutor,
    kind: ProviderKind,
    config: &HealthConfig,
) -> Result<ProbeReport, ProviderError> {
    let started = Instant::now();
    let mut capabilities = None;
    let mut latency_degraded = false;
    let mut probed = false;

    for strategy in &config.strategies {
        match strategy {
            HealthCheckStrategy::Metadata => {
                capabilities = Some(check_metadata(executor).await?);
                probed = true;
            },
            HealthCheckStrategy::Echo => {
                check_echo(executor, kind).await?;
                probed = true;
            },
            HealthCheckStrategy::Latency => {
                if !probed {
                    capabilities = Some(check_metadata(executor).await?);
                    probed = true;
                }
                latency_degraded = elapsed_ms(started) > config.latency_threshold_ms;
            },
            HealthCheckStrategy::FullRoundTrip => {
                check_round_trip(executor, kind).await?;
                probed = true;
            },
        }
    }

    Ok(ProbeReport {
        latency_ms: elapsed_ms(started),
        latency_degraded,
        capabilities,
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn check_metadata(
    executor: &dyn VoiceProviderExecutor,
) -> Result<ProviderCapabilities, ProviderError> {
    let capabilities = executor.capabilities().await?;
    if !executor.is_healthy().await {
        return Err(ProviderError::ServiceUnavailable(format!(
            "{} reports unhealthy",
            executor.name()
        )));
    }
    Ok(capabilities)
}

async fn check_echo(
    executor: &dyn VoiceProviderExecutor,
    kind: ProviderKind,
) -> Result<(), ProviderError> {
    if kind.supports(OperationKind::Tts) {
        executor
            .synthesize(ECHO_TEXT, &SynthesisOptions::default())
            .await?;
    } else {
        let silence = AudioBuffer::silence(PROBE_SAMPLE_RATE, PROBE_DURATION_MS);
        executor
            .transcribe(&silence, &TranscriptionOptions::default())
            .await?;
    }
    Ok(())
}

async fn check_round_trip(
    executor: &dyn VoiceProviderExecutor,
    kind: ProviderKind,
) -> Result<(), ProviderError> {
    match kind {
        ProviderKind::Both => {
            let audio = synthesize_non_empty(executor).await?;
            transcribe_non_empty(executor, &audio).await
        },
        ProviderKind::Tts => synthesize_non_empty(executor).await.map(|_| ()),
        ProviderKind::Stt => {
            let silence = AudioBuffer::silence(PROBE_SAMPLE_RATE, PROBE_DURATION_MS);
            transcribe_non_empty(executor, &silence).await
        },
    }
}

async fn synthesize_non_empty(
    executor: &dyn VoiceProviderExecutor,
) -> Result<AudioBuffer, ProviderError> {
    let audio = executor
        .synthesize(ROUND_TRIP_TEXT, &SynthesisOptions::default())
        .await?;
    if audio.is_empty() {
        return Err(ProviderError::SynthesisFailed(
            "round-trip synthesis returned no audio".to_string(),
        ));
    }
    Ok(audio)
}

async fn transcribe_non_empty(
    executor: &dyn VoiceProviderExecutor,
    audio: &AudioBuffer,
) -> Result<(), ProviderError> {
    let result = executor
        .transcribe(audio, &TranscriptionOptions::default())
        .await?;
    if result.text.trim().is_empty() {
        return Err(ProviderError::TranscriptionFailed(
            "round-trip transcription returned no text".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use voice_provider::testing::{ScriptedExecutor, Step};

    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(&HealthConfig::default())
    }

    #[test]
    fn config_default_values() {
        let config = HealthConfig::default();
        assert_eq!(config.interval_ms, 60_000);
        assert_eq!(config.initial_delay_ms, 5_000);
        assert_eq!(config.timeout_ms, 5_000);
        assert_eq!(config.healthy_threshold, 2);
        assert_eq!(config.unhealthy_threshold, 3);
        assert!(config.feeds_circuit_breaker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn starts_unknown() {
        let tracker = tracker();
        let state = tracker.snapshot();
        assert_eq!(state.status, HealthStatus::Unknown);
        assert!(state.last_checked_at.is_none());
    }

    #[test]
    fn degrades_exactly_at_threshold() {
        let tracker = tracker();
        assert_eq!(tracker.record_failure("boom"), None);
        assert_eq!(tracker.record_failure("boom"), None);
        assert_eq!(
            tracker.record_failure("boom"),
            Some(HealthTransition::Degraded {
                consecutive_failures: 3
            })
        );
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        // Further failures do not re-emit
        assert_eq!(tracker.record_failure("boom"), None);
        assert_eq!(tracker.snapshot().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn single_success_does_not_recover() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_failure("down");
        }
        assert_eq!(tracker.record_success(Some(10)), None);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        assert_eq!(
            tracker.record_success(Some(12)),
            Some(HealthTransition::Recovered {
                consecutive_successes: 2
            })
        );
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.snapshot().last_latency_ms, Some(12));
    }

    #[test]
    fn interleaved_results_keep_status() {
        let tracker = tracker();
        tracker.record_success(None);
        tracker.record_success(None);
        assert_eq!(tracker.status(), HealthStatus::Healthy);

        for _ in 0..10 {
            tracker.record_failure("flaky");
            tracker.record_failure("flaky");
            tracker.record_success(None);
        }
        assert_eq!(tracker.status(), HealthStatus::Healthy);
    }

    #[test]
    fn latency_flag_reports_rising_edge() {
        let tracker = tracker();
        assert!(tracker.set_latency_degraded(true));
        assert!(!tracker.set_latency_degraded(true));
        assert!(!tracker.set_latency_degraded(false));
        assert!(tracker.set_latency_degraded(true));
    }

    #[tokio::test]
    async fn metadata_probe_fails_when_provider_reports_unhealthy() {
        let executor = ScriptedExecutor::new("whisper");
        executor.set_healthy(false);

        let result = probe(&executor, ProviderKind::Stt, &HealthConfig::default()).await;
        assert!(matches!(result, Err(ProviderError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn metadata_probe_returns_capabilities() {
        let executor = ScriptedExecutor::new("whisper");
        let report = probe(&executor, ProviderKind::Stt, &HealthConfig::default())
            .await
            .unwrap();
        assert!(report.capabilities.is_some());
        assert!(!report.latency_degraded);
        assert_eq!(executor.dispatch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_flagged_but_passes() {
        let executor = ScriptedExecutor::new("piper");
        executor.push(Step::SucceedAfter(Duration::from_millis(400)));
        let config = HealthConfig {
            strategies: vec![HealthCheckStrategy::Echo, HealthCheckStrategy::Latency],
            latency_threshold_ms: 250,
            ..Default::default()
        };

        let report = probe(&executor, ProviderKind::Tts, &config).await.unwrap();
        assert!(report.latency_degraded);
        assert!(report.latency_ms >= 400);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out() {
        let executor = ScriptedExecutor::new("stuck");
        executor.push(Step::Hang);
        let config = HealthConfig {
            strategies: vec![HealthCheckStrategy::Echo],
            timeout_ms: 1_000,
            ..Default::default()
        };

        let result = probe(&executor, ProviderKind::Tts, &config).await;
        assert_eq!(result, Err(ProviderError::Timeout(1_000)));
    }

    #[tokio::test]
    async fn echo_uses_transcription_for_stt_only() {
        let executor = ScriptedExecutor::new("deepgram");
        executor.push(Step::Fail(ProviderError::TranscriptionFailed(
            "no model".to_string(),
        )));
        let config = HealthConfig {
            strategies: vec![HealthCheckStrategy::Echo],
            ..Default::default()
        };

        let result = probe(&executor, ProviderKind::Stt, &config).await;
        assert!(matches!(result, Err(ProviderError::TranscriptionFailed(_))));
    }

    #[tokio::test]
    async fn round_trip_for_dual_provider_dispatches_twice() {
        let executor = ScriptedExecutor::new("azure");
        let config = HealthConfig {
            strategies: vec![HealthCheckStrategy::FullRoundTrip],
            ..Default::default()
        };

        probe(&executor, ProviderKind::Both, &config).await.unwrap();
        assert_eq!(executor.dispatch_count(), 2);
    }
}
