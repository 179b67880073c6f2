//! Transaction coordination and resilience primitives for services that
//! persist data across independent failure domains (relational store,
//! document store, cache).
//!
//! The crate is organized bottom-up:
//!
//! - [`retry`] - pure retry decision logic (classification + backoff)
//! - [`breaker`] - circuit breaker guarding calls to one fallible resource
//! - [`executor`] - retried execution of a single-participant transaction
//! - [`unit_of_work`] - ordered action/rollback batches committed as one unit
//! - [`saga`] - independently-committing steps with reverse compensation
//! - [`two_phase`] - atomic commitment across N in-process participants
//!
//! Components compose explicitly: a saga step's action may itself be an
//! executor-guarded call, and a two-phase participant may route its calls
//! through a [`breaker::CircuitBreaker`] to avoid hammering a degraded
//! backend. Nothing here reads the environment; configuration arrives as
//! structs (see [`config`]) built once at process start.

pub mod breaker;
pub mod config;
pub mod executor;
pub mod retry;
pub mod saga;
pub mod two_phase;
pub mod unit_of_work;


#[cfg(feature = "schema")]
pub use schemars::JsonSchema;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitStateKind};
pub use config::{ResilienceConfig, RetryProfiles};
pub use executor::{
	ActionKind, IsolationLevel, TransactionContext, TransactionExecutor, TransactionOperation,
	TransactionOptions, TransactionResult,
};
pub use retry::{ErrorClass, InvalidRetryConfig, RetryConfig, RetryDecision, RetryPolicy};
pub use saga::{SagaError, SagaManager, SagaResult, SagaStep, StepResult};
pub use two_phase::{
	TransactionParticipant, TwoPhaseCommitManager, TwoPhaseConfig, TwoPhaseError, TwoPhaseResult,
};
pub use unit_of_work::UnitOfWork;

/// Boxed error type accepted at the crate's boundaries. Anything whose
/// `Display` output yields a classifiable signature works; storage driver
/// errors typically do.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Serde support for durations expressed as Go-style strings ("500ms",
/// "30s", "1m30s").
pub mod serde_dur {
	use std::time::Duration;

	use serde::de::Error;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_str(&durationfmt::to_string(*dur))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(de)?;
		parse(&raw).map_err(D::Error::custom)
	}

	pub(crate) fn parse(raw: &str) -> Result<Duration, String> {
		let nanos = go_parse_duration::parse_duration(raw)
			.map_err(|e| format!("invalid duration {raw:?}: {e:?}"))?;
		u64::try_from(nanos)
			.map(Duration::from_nanos)
			.map_err(|_| format!("negative duration {raw:?}"))
	}
}

/// Like [`serde_dur`], for `Option<Duration>` fields.
pub mod serde_dur_option {
	use std::time::Duration;

	use serde::de::Error;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(dur: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
		match dur {
			Some(d) => ser.serialize_some(&durationfmt::to_string(*d)),
			None => ser.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
		Option::<String>::deserialize(de)?
			.map(|raw| super::serde_dur::parse(&raw).map_err(D::Error::custom))
			.transpose()
	}
}
