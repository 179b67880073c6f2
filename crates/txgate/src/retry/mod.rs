//! Retry decision logic: error classification and backoff computation.
//!
//! A [`RetryPolicy`] is pure - given an error signature and an attempt
//! number it decides retry-or-stop and the delay before the next attempt.
//! It holds no mutable state; the components that loop ([`crate::executor`])
//! own the attempt counter and the sleep.

use std::num::NonZeroU8;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::*;

#[cfg(test)]
mod tests;

/// Signatures that are never worth retrying: the call will fail the same
/// way every time until a human or a schema change intervenes.
const NON_RETRYABLE_SIGNATURES: &[&str] = &[
	"authentication failed",
	"unauthorized",
	"permission denied",
	"constraint violation",
	"duplicate key",
	"syntax error",
	"invalid input",
];

/// Signatures of transient faults worth retrying. Used by the conservative
/// per-class profiles in [`crate::config`]; a config without an explicit
/// allow-list retries everything not denied.
const RETRYABLE_SIGNATURES: &[&str] = &[
	"connection refused",
	"connection reset",
	"connection closed",
	"broken pipe",
	"timeout",
	"timed out",
	"dns",
	"temporarily unavailable",
	"too many connections",
];

pub(crate) fn default_non_retryable() -> Vec<String> {
	NON_RETRYABLE_SIGNATURES.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn default_retryable() -> Vec<String> {
	RETRYABLE_SIGNATURES.iter().map(|s| s.to_string()).collect()
}

/// Configuration for retry behavior.
///
/// `max_attempts` counts every attempt including the first, so `1` means
/// "no retries". Matching against the allow/deny lists is case-insensitive
/// substring matching on the error's `Display` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub struct RetryConfig {
	/// Maximum number of attempts, including the first (default: 3)
	#[serde(default = "default_max_attempts")]
	pub max_attempts: NonZeroU8,

	/// Delay before the second attempt (default: 100ms)
	#[serde(default = "default_initial_delay", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub initial_delay: Duration,

	/// Upper bound for any computed delay (default: 2s)
	#[serde(default = "default_max_delay", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub max_delay: Duration,

	/// Multiplier applied to the base delay after each failed attempt
	/// (default: 2.0)
	#[serde(default = "default_backoff_multiplier")]
	pub backoff_multiplier: f64,

	/// Error signatures that are retried. When absent, every error not
	/// matched by `non_retryable_errors` is retried.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retryable_errors: Option<Vec<String>>,

	/// Error signatures that are never retried. Takes precedence over
	/// `retryable_errors`.
	#[serde(default = "default_non_retryable")]
	pub non_retryable_errors: Vec<String>,
}

fn default_max_attempts() -> NonZeroU8 {
	NonZeroU8::new(3).unwrap_or(NonZeroU8::MIN)
}

fn default_initial_delay() -> Duration {
	Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
	Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
	2.0
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: default_max_attempts(),
			initial_delay: default_initial_delay(),
			max_delay: default_max_delay(),
			backoff_multiplier: default_backoff_multiplier(),
			retryable_errors: None,
			non_retryable_errors: default_non_retryable(),
		}
	}
}

impl RetryConfig {
	/// Check the invariant serde defaults alone cannot enforce.
	pub fn validate(&self) -> Result<(), InvalidRetryConfig> {
		if self.initial_delay > self.max_delay {
			return Err(InvalidRetryConfig {
				initial_delay: self.initial_delay,
				max_delay: self.max_delay,
			});
		}
		Ok(())
	}
}

/// Error returned for a retry configuration that violates its invariants.
#[derive(Debug, Error)]
#[error("initial delay {initial_delay:?} exceeds max delay {max_delay:?}")]
pub struct InvalidRetryConfig {
	pub initial_delay: Duration,
	pub max_delay: Duration,
}

/// Classification of an error signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Transient - retrying may succeed.
	Retryable,
	/// Deterministic - retrying will fail the same way.
	NonRetryable,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
	/// Sleep for `delay`, then attempt again.
	Retry { delay: Duration },
	/// Give up; surface the last failure verbatim.
	Stop,
}

/// Pure retry decision logic over a validated [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	config: RetryConfig,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			config: RetryConfig::default(),
		}
	}
}

impl RetryPolicy {
	pub fn new(config: RetryConfig) -> Result<Self, InvalidRetryConfig> {
		config.validate()?;
		Ok(Self { config })
	}

	/// Construct without validating. For internal call sites that derive a
	/// config from an already-validated one.
	pub(crate) fn unvalidated(config: RetryConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> &RetryConfig {
		&self.config
	}

	/// Classify an error by its signature. The deny-list wins over the
	/// allow-list; with no allow-list every unmatched error is retryable.
	pub fn classify(&self, signature: &str) -> ErrorClass {
		let signature = signature.to_ascii_lowercase();
		if matches_any(&self.config.non_retryable_errors, &signature) {
			return ErrorClass::NonRetryable;
		}
		match &self.config.retryable_errors {
			Some(allowed) if !matches_any(allowed, &signature) => ErrorClass::NonRetryable,
			_ => ErrorClass::Retryable,
		}
	}

	/// Decide what to do after the given (1-based) attempt failed with
	/// `signature`. Never allows more than `max_attempts` attempts.
	pub fn decide(&self, signature: &str, attempt: u32) -> RetryDecision {
		if attempt >= u32::from(self.config.max_attempts.get()) {
			return RetryDecision::Stop;
		}
		if self.classify(signature) == ErrorClass::NonRetryable {
			return RetryDecision::Stop;
		}
		RetryDecision::Retry {
			delay: self.backoff_delay(attempt),
		}
	}

	/// Delay after the given (1-based) failed attempt:
	/// `min(max_delay, initial_delay * multiplier^(attempt-1) * jitter)`
	/// with jitter drawn uniformly from [0.5, 1.0] so that concurrent
	/// callers hitting the same fault do not retry in lockstep.
	pub fn backoff_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1);
		let base = self.config.initial_delay.as_secs_f64()
			* self.config.backoff_multiplier.powi(exponent as i32);
		let jitter = rand::rng().random_range(0.5..=1.0);
		Duration::from_secs_f64((base * jitter).min(self.config.max_delay.as_secs_f64()))
	}
}

fn matches_any(patterns: &[String], signature: &str) -> bool {
	patterns
		.iter()
		.any(|p| signature.contains(p.to_ascii_lowercase().as_str()))
}
