//! Circuit breaker guarding calls to one fallible resource.
//!
//! State machine:
//!
//! ```text
//! CLOSED --[failures >= failure_threshold]--> OPEN
//! OPEN --[recovery_timeout elapsed, checked on next call]--> HALF_OPEN
//! HALF_OPEN --[SUCCESS_THRESHOLD consecutive successes]--> CLOSED
//! HALF_OPEN --[any failure]--> OPEN
//! ```
//!
//! While open, calls are rejected immediately with
//! [`CircuitBreakerError::CircuitOpen`] and the wrapped operation is never
//! invoked. There is no background timer; the open-to-half-open transition
//! is evaluated lazily when the next call arrives.
//!
//! Breakers are long-lived: one per protected resource, created at process
//! start and shared by every caller of that resource. State transitions are
//! serialized under a mutex; the wrapped operation itself runs unlocked, so
//! concurrent calls through the same breaker only contend for the short
//! read-modify-write sections.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::*;


/// Consecutive successes required in half-open before the circuit closes.
pub const SUCCESS_THRESHOLD: u32 = 3;

/// Error surfaced by a call through a circuit breaker.
///
/// `CircuitOpen` is a distinct condition, not a generic failure: the wrapped
/// operation was never invoked and the caller should back off rather than
/// retry immediately.
#[derive(Debug, Clone)]
pub enum CircuitBreakerError {
	/// Circuit is open - the call was rejected without invoking the
	/// wrapped operation.
	CircuitOpen {
		/// Name of the circuit breaker
		name: String,
		/// Time remaining until a trial call will be admitted
		retry_after: Option<Duration>,
	},
	/// The wrapped operation ran and failed.
	OperationFailed(String),
}

impl fmt::Display for CircuitBreakerError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CircuitBreakerError::CircuitOpen { name, retry_after } => {
				write!(f, "circuit '{}' is open", name)?;
				if let Some(dur) = retry_after {
					write!(f, ", retry after {:?}", dur)?;
				}
				Ok(())
			},
			CircuitBreakerError::OperationFailed(msg) => write!(f, "operation failed: {}", msg),
		}
	}
}

impl std::error::Error for CircuitBreakerError {}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub struct CircuitBreakerConfig {
	/// Name used in logs and rejection errors
	#[serde(default)]
	pub name: String,

	/// Number of failures within the monitoring period before the circuit
	/// opens
	#[serde(default = "default_failure_threshold")]
	pub failure_threshold: u32,

	/// Duration the circuit stays open before the next call is admitted as
	/// a trial
	#[serde(default = "default_recovery_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub recovery_timeout: Duration,

	/// Window in which failures count toward the threshold; older failures
	/// are forgotten
	#[serde(default = "default_monitoring_period", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub monitoring_period: Duration,
}

fn default_failure_threshold() -> u32 {
	5
}

fn default_recovery_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_monitoring_period() -> Duration {
	Duration::from_secs(60)
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			name: String::new(),
			failure_threshold: default_failure_threshold(),
			recovery_timeout: default_recovery_timeout(),
			monitoring_period: default_monitoring_period(),
		}
	}
}

/// The externally visible state of a circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitStateKind {
	/// Requests flow normally
	#[default]
	Closed,
	/// Requests are rejected without invoking the resource
	Open,
	/// Trial requests are admitted to probe for recovery
	HalfOpen,
}

/// Mutable breaker state. An explicit struct rather than closure-captured
/// counters so the state machine is inspectable and testable independent of
/// any wrapped operation.
#[derive(Debug, Clone)]
struct BreakerState {
	kind: CircuitStateKind,
	failure_count: u32,
	half_open_successes: u32,
	last_failure_at: Option<Instant>,
	opened_at: Option<Instant>,
}

impl BreakerState {
	fn new() -> Self {
		Self {
			kind: CircuitStateKind::Closed,
			failure_count: 0,
			half_open_successes: 0,
			last_failure_at: None,
			opened_at: None,
		}
	}

	fn record_failure(&mut self) {
		self.failure_count += 1;
		self.last_failure_at = Some(Instant::now());
	}

	fn trip_open(&mut self) {
		self.kind = CircuitStateKind::Open;
		self.opened_at = Some(Instant::now());
		self.half_open_successes = 0;
	}

	fn to_half_open(&mut self) {
		self.kind = CircuitStateKind::HalfOpen;
		self.half_open_successes = 0;
	}

	fn reset_closed(&mut self) {
		self.kind = CircuitStateKind::Closed;
		self.failure_count = 0;
		self.half_open_successes = 0;
		self.last_failure_at = None;
		self.opened_at = None;
	}

	fn failures_within(&self, window: Duration) -> bool {
		match self.last_failure_at {
			Some(at) => at.elapsed() <= window,
			None => false,
		}
	}
}

/// Guard around one fallible resource.
///
/// The only mutable shared state in the crate lives here, behind a mutex.
/// Admission and outcome recording are two short critical sections; the
/// wrapped operation runs between them, unlocked, so slow calls never block
/// other callers' state transitions.
pub struct CircuitBreaker {
	config: CircuitBreakerConfig,
	state: Mutex<BreakerState>,
}

impl CircuitBreaker {
	pub fn new(config: CircuitBreakerConfig) -> Self {
		Self {
			config,
			state: Mutex::new(BreakerState::new()),
		}
	}

	pub fn config(&self) -> &CircuitBreakerConfig {
		&self.config
	}

	/// Current state of the circuit.
	pub fn state(&self) -> CircuitStateKind {
		self.state.lock().kind
	}

	/// Failures currently counted toward the threshold.
	pub fn failure_count(&self) -> u32 {
		self.state.lock().failure_count
	}

	/// Run one operation through the breaker.
	///
	/// Admission may lazily transition an open circuit to half-open when the
	/// recovery timeout has elapsed since the last failure. A rejected call
	/// returns [`CircuitBreakerError::CircuitOpen`] without invoking
	/// `operation`.
	pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: fmt::Display,
	{
		self.admit()?;
		match operation().await {
			Ok(value) => {
				self.record_success();
				Ok(value)
			},
			Err(e) => {
				let message = e.to_string();
				self.record_failure(&message);
				Err(CircuitBreakerError::OperationFailed(message))
			},
		}
	}

	/// First critical section: decide whether this call may proceed.
	fn admit(&self) -> Result<(), CircuitBreakerError> {
		let mut state = self.state.lock();
		match state.kind {
			CircuitStateKind::Closed | CircuitStateKind::HalfOpen => Ok(()),
			CircuitStateKind::Open => {
				let since_failure = state.last_failure_at.map(|at| at.elapsed());
				let recovered = since_failure
					.map(|elapsed| elapsed >= self.config.recovery_timeout)
					.unwrap_or(true);
				if recovered {
					state.to_half_open();
					debug!(
						circuit = %self.config.name,
						"recovery timeout elapsed, admitting trial call in half-open"
					);
					Ok(())
				} else {
					let retry_after = since_failure
						.and_then(|elapsed| self.config.recovery_timeout.checked_sub(elapsed));
					Err(CircuitBreakerError::CircuitOpen {
						name: self.config.name.clone(),
						retry_after,
					})
				}
			},
		}
	}

	/// Second critical section: fold a successful outcome into the state.
	fn record_success(&self) {
		let mut state = self.state.lock();
		match state.kind {
			CircuitStateKind::Closed => {
				// Failures outside the monitoring period no longer count.
				if !state.failures_within(self.config.monitoring_period) {
					state.failure_count = 0;
					state.last_failure_at = None;
				}
			},
			CircuitStateKind::HalfOpen => {
				state.half_open_successes += 1;
				if state.half_open_successes >= SUCCESS_THRESHOLD {
					state.reset_closed();
					debug!(circuit = %self.config.name, "circuit closed after successful trials");
				}
			},
			// A concurrent caller reopened the circuit while this call was
			// in flight; its success does not count as a trial.
			CircuitStateKind::Open => {},
		}
	}

	/// Second critical section: fold a failed outcome into the state.
	fn record_failure(&self, message: &str) {
		let mut state = self.state.lock();
		match state.kind {
			CircuitStateKind::Closed => {
				if state.failures_within(self.config.monitoring_period) {
					state.record_failure();
				} else {
					// Window lapsed: this failure starts a fresh count.
					state.failure_count = 1;
					state.last_failure_at = Some(Instant::now());
				}
				if state.failure_count >= self.config.failure_threshold {
					state.trip_open();
					warn!(
						circuit = %self.config.name,
						failure_count = state.failure_count,
						error = message,
						"failure threshold reached, circuit opened"
					);
				}
			},
			CircuitStateKind::HalfOpen => {
				state.record_failure();
				state.trip_open();
				warn!(
					circuit = %self.config.name,
					error = message,
					"trial call failed, circuit reopened"
				);
			},
			CircuitStateKind::Open => {
				state.last_failure_at = Some(Instant::now());
			},
		}
	}
}
