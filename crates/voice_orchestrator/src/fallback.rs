//! Fallback across ranked candidates
//!
//! A [`FallbackExecutor`] walks the selector's candidates one at a time. The
//! per-candidate dispatch (circuit permit, retries, deadline, bookkeeping) is
//! supplied by the caller; this module decides whether to switch to the next
//! candidate and records the audit trail of the session.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use voice_provider::{OperationKind, ProviderError, ProviderId};

use crate::error::{ConfigError, ExhaustionReason, OpenCircuit, OrchestratorError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::selector::Candidate;

/// Rules for switching between providers within one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchingConfig {
    /// Try the next candidate after a failure (default: true)
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,

    /// Switches allowed per call (default: 2)
    #[serde(default = "default_max_switches")]
    pub max_switches: u32,

    /// How long a failed provider is deferred by later calls (default: 10000)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Only switch to providers with the first candidate's priority
    #[serde(default)]
    pub tier_locked: bool,
}

const fn default_allow_fallback() -> bool {
    true
}

const fn default_max_switches() -> u32 {
    2
}

const fn default_cooldown_ms() -> u64 {
    10_000
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            allow_fallback: default_allow_fallback(),
            max_switches: default_max_switches(),
            cooldown_ms: default_cooldown_ms(),
            tier_locked: false,
        }
    }
}

impl SwitchingConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_switches > 16 {
            return Err(ConfigError::invalid(
                "switching.max_switches",
                "must be at most 16",
            ));
        }
        Ok(())
    }

    /// Cooldown window
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Process-wide record of providers recently switched away from
#[derive(Debug, Default)]
pub struct CooldownTracker {
    until: RwLock<HashMap<ProviderId, Instant>>,
}

impl CooldownTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer a provider until `expiry`
    pub fn mark(&self, provider_id: &ProviderId, expiry: Instant) {
        self.until.write().insert(provider_id.clone(), expiry);
    }

    /// Forget a provider's cooldown
    pub fn clear(&self, provider_id: &ProviderId) {
        self.until.write().remove(provider_id);
    }

    /// Remaining cooldown, if any
    #[must_use]
    pub fn remaining(&self, provider_id: &ProviderId) -> Option<Duration> {
        let now = Instant::now();
        self.until
            .read()
            .get(provider_id)
            .filter(|expiry| **expiry > now)
            .map(|expiry| expiry.saturating_duration_since(now))
    }

    /// True while the provider is cooling down
    #[must_use]
    pub fn is_cooling(&self, provider_id: &ProviderId) -> bool {
        self.remaining(provider_id).is_some()
    }
}

/// Result of one candidate attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Candidate produced the result
    Succeeded,
    /// Candidate failed after its retries
    Failed,
    /// Candidate reported a permanent error
    Rejected,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Audit record of one candidate attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Candidate
    pub provider_id: ProviderId,
    /// Dispatches made, including retries
    pub dispatches: u32,
    /// How the attempt ended
    pub outcome: AttemptOutcome,
    /// Final error of a failed or rejected attempt
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ProviderError>,
    /// Wall time of the attempt
    pub elapsed_ms: u64,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<ProviderError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} after {} dispatch(es) in {}ms",
            self.provider_id, self.outcome, self.dispatches, self.elapsed_ms
        )?;
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}

/// A candidate passed over without dispatching
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    /// Candidate
    pub provider_id: ProviderId,
    /// Why it was skipped
    pub reason: String,
}

/// What a candidate attempt produced, reported by the dispatch closure
#[derive(Debug)]
pub enum CandidateOutcome<T> {
    /// The candidate produced a value
    Succeeded {
        /// Result
        value: T,
        /// Dispatches made
        dispatches: u32,
    },
    /// The candidate failed; switching may continue
    Failed {
        /// Final error
        error: ProviderError,
        /// Dispatches made
        dispatches: u32,
    },
    /// The candidate reported a permanent error; the session stops
    Rejected {
        /// The permanent error
        error: ProviderError,
        /// Dispatches made
        dispatches: u32,
    },
    /// The circuit refused a permit at dispatch time
    CircuitRefused {
        /// Remaining open window
        retry_after: Duration,
    },
    /// The candidate disappeared (removed or disabled) since selection
    Unavailable,
}

/// Summary of a completed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Operation served
    pub operation: OperationKind,
    /// Provider that produced the result
    pub provider_id: ProviderId,
    /// Providers dispatched to, in order
    pub attempted: Vec<ProviderId>,
    /// Per-candidate audit trail
    pub attempts: Vec<AttemptRecord>,
    /// Candidates passed over
    pub skipped: Vec<SkippedCandidate>,
    /// Switches made
    pub switch_count: u32,
    /// Cooldowns set by this session, as remaining milliseconds at completion
    pub cooldowns_ms: Vec<(ProviderId, u64)>,
    /// Unhealthy providers were used as a last resort
    pub degraded: bool,
    /// Wall time of the session
    pub elapsed_ms: u64,
}

/// State of one logical call
#[derive(Debug)]
pub struct SwitchSession {
    operation: OperationKind,
    attempted: Vec<ProviderId>,
    attempts: Vec<AttemptRecord>,
    skipped: Vec<SkippedCandidate>,
    open: Vec<OpenCircuit>,
    switch_count: u32,
    started_at: Instant,
    cooldown_expiry: HashMap<ProviderId, Instant>,
}

impl SwitchSession {
    /// Start a session now
    #[must_use]
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            attempted: Vec::new(),
            attempts: Vec::new(),
            skipped: Vec::new(),
            open: Vec::new(),
            switch_count: 0,
            started_at: Instant::now(),
            cooldown_expiry: HashMap::new(),
        }
    }

    /// Switches made so far
    #[must_use]
    pub const fn switch_count(&self) -> u32 {
        self.switch_count
    }

    /// Audit trail so far
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    fn record(
        &mut self,
        provider_id: &ProviderId,
        dispatches: u32,
        outcome: AttemptOutcome,
        error: Option<ProviderError>,
        started: Instant,
    ) {
        self.attempted.push(provider_id.clone());
        self.attempts.push(AttemptRecord {
            provider_id: provider_id.clone(),
            dispatches,
            outcome,
            error,
            elapsed_ms: elapsed_ms(started),
        });
    }

    fn skip(&mut self, provider_id: &ProviderId, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(provider = %provider_id, reason = %reason, "Skipping candidate");
        self.skipped.push(SkippedCandidate {
            provider_id: provider_id.clone(),
            reason,
        });
    }

    fn into_report(self, provider_id: ProviderId, degraded: bool) -> SessionReport {
        let now = Instant::now();
        let mut cooldowns_ms: Vec<(ProviderId, u64)> = self
            .cooldown_expiry
            .into_iter()
            .map(|(id, expiry)| {
                let remaining = expiry.saturating_duration_since(now);
                (id, u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
            })
            .collect();
        cooldowns_ms.sort();

        SessionReport {
            operation: self.operation,
            provider_id,
            attempted: self.attempted,
            attempts: self.attempts,
            skipped: self.skipped,
            switch_count: self.switch_count,
            cooldowns_ms,
            degraded,
            elapsed_ms: elapsed_ms(self.started_at),
        }
    }

    fn exhausted(self, reason: ExhaustionReason, last_error: Option<ProviderError>) -> OrchestratorError {
        warn!(
            operation = %self.operation,
            reason = %reason,
            attempts = self.attempts.len(),
            "All providers exhausted"
        );
        OrchestratorError::AllProvidersExhausted {
            operation: self.operation,
            reason,
            last_error,
            attempts: self.attempts,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Drives one call across candidates
#[derive(Debug)]
pub struct FallbackExecutor<'a> {
    config: &'a SwitchingConfig,
    cooldowns: &'a CooldownTracker,
    events: &'a EventBus,
}

impl<'a> FallbackExecutor<'a> {
    /// Create an executor sharing the process-wide cooldowns and event bus
    #[must_use]
    pub const fn new(
        config: &'a SwitchingConfig,
        cooldowns: &'a CooldownTracker,
        events: &'a EventBus,
    ) -> Self {
        Self {
            config,
            cooldowns,
            events,
        }
    }

    /// Order candidates so that cooling-down providers come last
    #[must_use]
    pub fn order(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let (cooling, ready): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| self.cooldowns.is_cooling(&c.provider_id));
        ready.into_iter().chain(cooling).collect()
    }

    /// Try candidates in order until one succeeds
    ///
    /// `attempt` performs one candidate attempt and must never run
    /// candidates concurrently.
    pub async fn run<T, F, Fut>(
        &self,
        operation: OperationKind,
        candidates: Vec<Candidate>,
        degraded: bool,
        mut attempt: F,
    ) -> Result<(T, SessionReport), OrchestratorError>
    where
        F: FnMut(ProviderId) -> Fut,
        Fut: Future<Output = CandidateOutcome<T>>,
    {
        let ordered = self.order(candidates);
        let mut session = SwitchSession::new(operation);
        let mut tier: Option<u32> = None;
        let mut last_error: Option<ProviderError> = None;

        for (index, candidate) in ordered.iter().enumerate() {
            let provider_id = &candidate.provider_id;

            if self.config.tier_locked && tier.is_some_and(|t| t != candidate.priority) {
                session.skip(provider_id, "outside priority tier");
                continue;
            }

            let started = Instant::now();
            match attempt(provider_id.clone()).await {
                CandidateOutcome::Succeeded { value, dispatches } => {
                    self.cooldowns.clear(provider_id);
                    session.record(
                        provider_id,
                        dispatches,
                        AttemptOutcome::Succeeded,
                        None,
                        started,
                    );
                    if session.switch_count > 0 {
                        info!(
                            operation = %operation,
                            provider = %provider_id,
                            switches = session.switch_count,
                            "Fallback candidate succeeded"
                        );
                    }
                    return Ok((value, session.into_report(provider_id.clone(), degraded)));
                },
                CandidateOutcome::Rejected { error, dispatches } => {
                    session.record(
                        provider_id,
                        dispatches,
                        AttemptOutcome::Rejected,
                        Some(error.clone()),
                        started,
                    );
                    return Err(OrchestratorError::Rejected {
                        provider_id: provider_id.clone(),
                        source: error,
                        attempts: session.attempts,
                    });
                },
                CandidateOutcome::CircuitRefused { retry_after } => {
                    session.open.push(OpenCircuit {
                        provider_id: provider_id.clone(),
                        retry_after,
                    });
                    session.skip(provider_id, "circuit refused permit");
                },
                CandidateOutcome::Unavailable => {
                    session.skip(provider_id, "no longer available");
                },
                CandidateOutcome::Failed { error, dispatches } => {
                    tier.get_or_insert(candidate.priority);
                    session.record(
                        provider_id,
                        dispatches,
                        AttemptOutcome::Failed,
                        Some(error.clone()),
                        started,
                    );

                    if !self.config.allow_fallback {
                        return Err(session.exhausted(ExhaustionReason::FallbackDisabled, Some(error)));
                    }
                    if session.switch_count >= self.config.max_switches {
                        return Err(
                            session.exhausted(ExhaustionReason::MaxSwitchesReached, Some(error))
                        );
                    }
                    let remaining = &ordered[index + 1..];
                    if remaining.is_empty() {
                        return Err(session.exhausted(ExhaustionReason::NoCandidatesLeft, Some(error)));
                    }
                    if self.config.tier_locked
                        && !remaining.iter().any(|c| c.priority == candidate.priority)
                    {
                        return Err(session.exhausted(ExhaustionReason::TierExhausted, Some(error)));
                    }

                    let expiry = Instant::now() + self.config.cooldown();
                    self.cooldowns.mark(provider_id, expiry);
                    session.cooldown_expiry.insert(provider_id.clone(), expiry);
                    session.switch_count += 1;

                    warn!(
                        operation = %operation,
                        provider = %provider_id,
                        error = %error,
                        switch_count = session.switch_count,
                        "Switching to next provider"
                    );
                    self.events.publish(OrchestratorEvent::ProviderSwitched {
                        operation,
                        from: provider_id.clone(),
                        error_kind: error.code(),
                        switch_count: session.switch_count,
                    });
                    last_error = Some(error);
                },
            }
        }

        if session.attempts.is_empty() && !session.open.is_empty() {
            return Err(OrchestratorError::CircuitOpen {
                operation,
                providers: session.open,
            });
        }
        Err(session.exhausted(ExhaustionReason::NoCandidatesLeft, last_error))
    }
}
