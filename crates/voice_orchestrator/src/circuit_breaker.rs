//! Per-provider circuit breaker
//!
//! Stops dispatching to a provider that keeps failing, then probes it with a
//! bounded number of trial calls before letting traffic back in.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Provider is failing, requests are refused until `next_retry_at`
//! - **Half-Open**: A limited number of trial requests test recovery
//!
//! Every reopen lengthens the open window:
//! `min(timeout_ms * backoff_multiplier^reopens, max_backoff_ms)`.
//!
//! # Persistence
//!
//! With `persistence_dir` set, the state of each provider is written to
//! `<dir>/<provider>.circuit.json` on every transition and loaded again at
//! registration, so an open circuit survives a restart.
//!
//! # Example
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new(provider_id, CircuitBreakerConfig::default());
//! let permit = breaker.try_acquire()?;
//! match executor.synthesize(text, &options).await {
//!     Ok(audio) => { permit.succeed(); Ok(audio) }
//!     Err(e) => { permit.fail(); Err(e) }
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use voice_provider::ProviderId;

use crate::error::ConfigError;

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// When false the circuit never opens
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failed operations before opening (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful trials needed to close again (default: 2)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Initial open window in milliseconds (default: 30000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Concurrent trial calls admitted while half-open (default: 1)
    #[serde(default = "default_half_open_max_trials")]
    pub half_open_max_trials: u32,

    /// Growth of the open window per consecutive reopen (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound of the open window in milliseconds (default: 300000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Clear counters and the reopen count when the circuit closes
    #[serde(default = "default_true")]
    pub auto_reset: bool,

    /// Directory for persisted circuit state (disabled when unset)
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,
}

const fn default_true() -> bool {
    true
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_half_open_max_trials() -> u32 {
    1
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    300_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_timeout_ms(),
            half_open_max_trials: default_half_open_max_trials(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            auto_reset: default_true(),
            persistence_dir: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check ranges
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        let positive = [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_max_trials", self.half_open_max_trials),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(
                    format!("{prefix}.{field}"),
                    "must be greater than 0",
                ));
            }
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(
                format!("{prefix}.timeout_ms"),
                "must be greater than 0",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                format!("{prefix}.backoff_multiplier"),
                "must be a finite number >= 1.0",
            ));
        }
        if self.max_backoff_ms < self.timeout_ms {
            return Err(ConfigError::invalid(
                format!("{prefix}.max_backoff_ms"),
                "must not be smaller than timeout_ms",
            ));
        }
        Ok(())
    }

    /// Open window after `reopens` consecutive reopens
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    pub fn open_duration(&self, reopens: u32) -> Duration {
        let grown =
            (self.timeout_ms as f64) * self.backoff_multiplier.powi(reopens.min(64) as i32);
        Duration::from_millis(grown.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Phase of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Normal operation, requests pass through
    Closed,
    /// Provider is failing, requests are refused
    Open,
    /// Trial requests test recovery
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A phase change reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    /// The circuit opened (or reopened) for `retry_after`
    Opened {
        /// Length of the open window
        retry_after: Duration,
        /// Consecutive reopen count after this transition
        reopens: u32,
    },
    /// The circuit closed after successful trials
    Closed,
}

/// Error returned when the circuit refuses a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenError {
    /// Provider whose circuit refused
    pub provider_id: ProviderId,
    /// Time until the next trial is admitted (zero while half-open trials
    /// are exhausted)
    pub retry_after: Duration,
}

impl std::error::Error for CircuitOpenError {}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Circuit breaker open for provider '{}': retry in {}ms",
            self.provider_id,
            self.retry_after.as_millis()
        )
    }
}

/// Read-only view of a circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Current phase
    pub phase: CircuitPhase,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Successful trials while half-open
    pub success_count: u32,
    /// Consecutive reopens since the circuit last closed
    pub consecutive_reopens: u32,
    /// Trial calls currently running
    pub half_open_in_flight: u32,
    /// Remaining open window
    pub retry_after: Option<Duration>,
}

/// Serializable state for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedCircuitState {
    provider_id: String,
    phase: CircuitPhase,
    failure_count: u32,
    success_count: u32,
    consecutive_reopens: u32,
    /// Unix timestamp in milliseconds
    opened_at_ms: Option<u64>,
    /// Unix timestamp in milliseconds
    next_retry_at_ms: Option<u64>,
}

fn unix_ms(time: SystemTime) -> Option<u64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
}

impl PersistedCircuitState {
    fn from_internal(provider_id: &ProviderId, state: &CircuitInner) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            phase: state.phase,
            failure_count: state.failure_count,
            success_count: state.success_count,
            consecutive_reopens: state.consecutive_reopens,
            opened_at_ms: state.opened_at_system.and_then(unix_ms),
            next_retry_at_ms: state.next_retry_system.and_then(unix_ms),
        }
    }

    fn to_internal(&self) -> CircuitInner {
        let now = Instant::now();
        let now_system = SystemTime::now();
        let to_system = |ms: u64| SystemTime::UNIX_EPOCH + Duration::from_millis(ms);

        let opened_at_system = self.opened_at_ms.map(to_system);
        let next_retry_system = self.next_retry_at_ms.map(to_system);

        // Wall-clock deadlines are mapped back onto the monotonic clock
        let next_retry_at = next_retry_system.map(|deadline| {
            deadline
                .duration_since(now_system)
                .map_or(now, |remaining| now + remaining)
        });
        let opened_at = opened_at_system.map(|opened| {
            now_system
                .duration_since(opened)
                .ok()
                .and_then(|elapsed| now.checked_sub(elapsed))
                .unwrap_or(now)
        });

        // Trials in flight before the restart are gone
        let phase = match self.phase {
            CircuitPhase::Open if next_retry_at.is_none() => CircuitPhase::Closed,
            phase => phase,
        };

        CircuitInner {
            phase,
            failure_count: self.failure_count,
            success_count: self.success_count,
            consecutive_reopens: self.consecutive_reopens,
            half_open_in_flight: 0,
            opened_at,
            opened_at_system,
            next_retry_at,
            next_retry_system,
        }
    }
}

/// Internal state tracking
#[derive(Debug)]
struct CircuitInner {
    phase: CircuitPhase,
    failure_count: u32,
    success_count: u32,
    consecutive_reopens: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    opened_at_system: Option<SystemTime>,
    next_retry_at: Option<Instant>,
    next_retry_system: Option<SystemTime>,
}

impl CircuitInner {
    const fn closed() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_reopens: 0,
            half_open_in_flight: 0,
            opened_at: None,
            opened_at_system: None,
            next_retry_at: None,
            next_retry_system: None,
        }
    }

    fn open(&mut self, window: Duration) {
        let now = Instant::now();
        let now_system = SystemTime::now();
        self.phase = CircuitPhase::Open;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        self.opened_at = Some(now);
        self.opened_at_system = Some(now_system);
        self.next_retry_at = Some(now + window);
        self.next_retry_system = Some(now_system + window);
    }

    /// Lazily move from open to half-open once the window has passed
    fn refresh(&mut self, now: Instant) -> bool {
        if self.phase == CircuitPhase::Open && self.next_retry_at.is_some_and(|at| now >= at) {
            self.phase = CircuitPhase::HalfOpen;
            self.success_count = 0;
            self.half_open_in_flight = 0;
            return true;
        }
        false
    }

    fn retry_after(&self, now: Instant) -> Option<Duration> {
        match self.phase {
            CircuitPhase::Open => self
                .next_retry_at
                .map(|at| at.saturating_duration_since(now)),
            CircuitPhase::Closed | CircuitPhase::HalfOpen => None,
        }
    }
}

/// Circuit breaker guarding one provider
pub struct CircuitBreaker {
    provider_id: ProviderId,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitInner>,
    persistence_path: Option<PathBuf>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .field("phase", &self.phase())
            .field("persistence", &self.persistence_path)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a circuit breaker, loading persisted state if configured
    #[must_use]
    pub fn new(provider_id: ProviderId, config: CircuitBreakerConfig) -> Self {
        let persistence_path = config
            .persistence_dir
            .as_ref()
            .map(|dir| dir.join(format!("{provider_id}.circuit.json")));

        let initial_state = match &persistence_path {
            Some(path) => Self::load_state(path, &provider_id).unwrap_or_else(|e| {
                debug!(
                    provider = %provider_id,
                    error = %e,
                    "No existing circuit state found, starting fresh"
                );
                CircuitInner::closed()
            }),
            None => CircuitInner::closed(),
        };

        if persistence_path.is_some() {
            info!(
                provider = %provider_id,
                phase = %initial_state.phase,
                "Loaded circuit breaker state"
            );
        }

        Self {
            provider_id,
            config,
            state: RwLock::new(initial_state),
            persistence_path,
        }
    }

    fn load_state(path: &Path, provider_id: &ProviderId) -> Result<CircuitInner, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedCircuitState = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if persisted.provider_id != provider_id.as_str() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "State file is for provider '{}', expected '{}'",
                    persisted.provider_id, provider_id
                ),
            ));
        }

        Ok(persisted.to_internal())
    }

    fn save_state(&self) {
        let Some(ref path) = self.persistence_path else {
            return;
        };
        let persisted = {
            let state = self.state.read();
            PersistedCircuitState::from_internal(&self.provider_id, &state)
        };

        match serde_json::to_string_pretty(&persisted) {
            Ok(json) => {
                if let Some(parent) = path.parent() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        error!(
                            provider = %self.provider_id,
                            path = %parent.display(),
                            error = %e,
                            "Failed to create circuit state directory"
                        );
                        return;
                    }
                }
                if let Err(e) = std::fs::write(path, json) {
                    error!(
                        provider = %self.provider_id,
                        path = %path.display(),
                        error = %e,
                        "Failed to persist circuit breaker state"
                    );
                } else {
                    debug!(
                        provider = %self.provider_id,
                        phase = %persisted.phase,
                        "Persisted circuit breaker state"
                    );
                }
            },
            Err(e) => {
                error!(
                    provider = %self.provider_id,
                    error = %e,
                    "Failed to serialize circuit breaker state"
                );
            },
        }
    }

    /// Provider this circuit guards
    #[must_use]
    pub const fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    /// Effective configuration
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current phase, moving open to half-open if the window has passed
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        self.snapshot().phase
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let (snapshot, half_opened) = {
            let mut state = self.state.write();
            let half_opened = state.refresh(now);
            (
                CircuitSnapshot {
                    phase: state.phase,
                    failure_count: state.failure_count,
                    success_count: state.success_count,
                    consecutive_reopens: state.consecutive_reopens,
                    half_open_in_flight: state.half_open_in_flight,
                    retry_after: state.retry_after(now),
                },
                half_opened,
            )
        };
        if half_opened {
            self.log_half_open();
        }
        snapshot
    }

    fn log_half_open(&self) {
        debug!(
            provider = %self.provider_id,
            "Circuit transitioning from Open to HalfOpen"
        );
        self.save_state();
    }

    /// Ask for permission to dispatch
    ///
    /// Closed circuits always admit. Half-open circuits admit up to
    /// `half_open_max_trials` concurrent trials. Open circuits refuse until
    /// `next_retry_at`.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitOpenError> {
        if !self.config.enabled {
            return Ok(CircuitPermit::new(self, false));
        }

        let now = Instant::now();
        let (decision, half_opened) = {
            let mut state = self.state.write();
            let half_opened = state.refresh(now);
            let decision = match state.phase {
                CircuitPhase::Closed => Ok(false),
                CircuitPhase::HalfOpen => {
                    if state.half_open_in_flight < self.config.half_open_max_trials {
                        state.half_open_in_flight += 1;
                        Ok(true)
                    } else {
                        Err(Duration::ZERO)
                    }
                },
                CircuitPhase::Open => Err(state.retry_after(now).unwrap_or(Duration::ZERO)),
            };
            (decision, half_opened)
        };

        if half_opened {
            self.log_half_open();
        }

        match decision {
            Ok(trial) => Ok(CircuitPermit::new(self, trial)),
            Err(retry_after) => {
                debug!(
                    provider = %self.provider_id,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Circuit breaker refusing dispatch"
                );
                Err(CircuitOpenError {
                    provider_id: self.provider_id.clone(),
                    retry_after,
                })
            },
        }
    }

    /// Record a successful operation outside of a permit
    pub fn record_success(&self) -> Option<CircuitTransition> {
        self.on_success(Origin::OutOfBand)
    }

    /// Record a failed operation outside of a permit
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        self.on_failure(Origin::OutOfBand)
    }

    fn release_trial(&self) {
        let mut state = self.state.write();
        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
    }

    fn on_success(&self, origin: Origin) -> Option<CircuitTransition> {
        if !self.config.enabled {
            return None;
        }

        let transition = {
            let mut state = self.state.write();
            state.refresh(Instant::now());
            if origin == Origin::Trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match state.phase {
                CircuitPhase::Closed => {
                    state.failure_count = 0;
                    None
                },
                // Admitted while closed; says nothing about recovery
                CircuitPhase::HalfOpen if origin == Origin::Admitted => None,
                CircuitPhase::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        info!(
                            provider = %self.provider_id,
                            successes = state.success_count,
                            "Circuit transitioning from HalfOpen to Closed"
                        );
                        let reopens = state.consecutive_reopens;
                        *state = CircuitInner::closed();
                        if !self.config.auto_reset {
                            state.consecutive_reopens = reopens;
                        }
                        Some(CircuitTransition::Closed)
                    } else {
                        None
                    }
                },
                CircuitPhase::Open => None,
            }
        };

        if transition.is_some() {
            self.save_state();
        }
        transition
    }

    fn on_failure(&self, origin: Origin) -> Option<CircuitTransition> {
        if !self.config.enabled {
            return None;
        }

        let transition = {
            let mut state = self.state.write();
            state.refresh(Instant::now());
            if origin == Origin::Trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match state.phase {
                CircuitPhase::Closed => {
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        let window = self.config.open_duration(state.consecutive_reopens);
                        warn!(
                            provider = %self.provider_id,
                            failures = state.failure_count,
                            retry_after_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
                            "Circuit transitioning from Closed to Open"
                        );
                        state.open(window);
                        Some(CircuitTransition::Opened {
                            retry_after: window,
                            reopens: state.consecutive_reopens,
                        })
                    } else {
                        None
                    }
                },
                CircuitPhase::HalfOpen => {
                    state.consecutive_reopens = state.consecutive_reopens.saturating_add(1);
                    let window = self.config.open_duration(state.consecutive_reopens);
                    warn!(
                        provider = %self.provider_id,
                        reopens = state.consecutive_reopens,
                        retry_after_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
                        "Circuit transitioning from HalfOpen to Open after failure"
                    );
                    state.open(window);
                    Some(CircuitTransition::Opened {
                        retry_after: window,
                        reopens: state.consecutive_reopens,
                    })
                },
                CircuitPhase::Open => None,
            }
        };

        if transition.is_some() {
            self.save_state();
        }
        transition
    }
}

/// Where a settled outcome comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// `record_success` / `record_failure`
    OutOfBand,
    /// Permit handed out while the circuit was closed
    Admitted,
    /// Permit holding a half-open trial slot
    Trial,
}

/// Permission to dispatch one operation
///
/// Must be settled with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping it unsettled releases a half-open trial slot without counting
/// an outcome (used for permanent errors and cancelled calls).
#[derive(Debug)]
#[must_use]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    const fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// True if this permit occupies a half-open trial slot
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    const fn origin(&self) -> Origin {
        if self.trial { Origin::Trial } else { Origin::Admitted }
    }

    /// Report the operation as successful
    pub fn succeed(mut self) -> Option<CircuitTransition> {
        self.settled = true;
        self.breaker.on_success(self.origin())
    }

    /// Report the operation as failed
    pub fn fail(mut self) -> Option<CircuitTransition> {
        self.settled = true;
        self.breaker.on_failure(self.origin())
    }

    /// Give the permit back without counting an outcome
    pub fn release(self) {}
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
