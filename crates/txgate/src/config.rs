//! Aggregated configuration surface for the coordination core.
//!
//! Everything defaults; a process can run on `ResilienceConfig::default()`
//! with no external configuration at all. When a deployment does configure
//! it (JSON or YAML, durations as Go-style strings), the struct is loaded
//! once at process start and handed to component constructors - components
//! themselves never read the environment.

use serde::{Deserialize, Serialize};

use crate::*;

/// Retry profiles per operation class. Connection establishment tolerates
/// more attempts than statement execution; transactional units sit in
/// between, bounded by the cost of re-running the whole unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub struct RetryProfiles {
	#[serde(default = "connection_profile")]
	pub connection: RetryConfig,
	#[serde(default = "query_profile")]
	pub query: RetryConfig,
	#[serde(default = "transaction_profile")]
	pub transaction: RetryConfig,
}

fn connection_profile() -> RetryConfig {
	RetryConfig {
		max_attempts: attempts(5),
		initial_delay: std::time::Duration::from_millis(200),
		max_delay: std::time::Duration::from_secs(5),
		// Connection faults are the well-known transient set; only retry
		// signatures on the allow-list.
		retryable_errors: Some(retry::default_retryable()),
		..RetryConfig::default()
	}
}

fn query_profile() -> RetryConfig {
	RetryConfig {
		max_attempts: attempts(3),
		initial_delay: std::time::Duration::from_millis(100),
		max_delay: std::time::Duration::from_secs(2),
		..RetryConfig::default()
	}
}

fn transaction_profile() -> RetryConfig {
	RetryConfig {
		max_attempts: attempts(3),
		initial_delay: std::time::Duration::from_millis(100),
		max_delay: std::time::Duration::from_secs(2),
		..RetryConfig::default()
	}
}

fn attempts(n: u8) -> std::num::NonZeroU8 {
	std::num::NonZeroU8::new(n).unwrap_or(std::num::NonZeroU8::MIN)
}

impl Default for RetryProfiles {
	fn default() -> Self {
		Self {
			connection: connection_profile(),
			query: query_profile(),
			transaction: transaction_profile(),
		}
	}
}

/// Top-level resilience configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub struct ResilienceConfig {
	#[serde(default)]
	pub retry: RetryProfiles,
	#[serde(default)]
	pub circuit_breaker: CircuitBreakerConfig,
	#[serde(default)]
	pub two_phase: TwoPhaseConfig,
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn test_defaults_need_no_external_config() {
		let config = ResilienceConfig::default();
		assert_eq!(config.retry.connection.max_attempts.get(), 5);
		assert_eq!(config.retry.query.max_attempts.get(), 3);
		assert_eq!(config.retry.transaction.max_attempts.get(), 3);
		assert!(config.retry.connection.retryable_errors.is_some());
		assert!(config.retry.query.retryable_errors.is_none());
		assert_eq!(config.circuit_breaker.failure_threshold, 5);
		assert_eq!(config.two_phase.participant_timeout, Duration::from_secs(5));

		// Every profile satisfies the delay invariant out of the box.
		config.retry.connection.validate().unwrap();
		config.retry.query.validate().unwrap();
		config.retry.transaction.validate().unwrap();
	}

	#[test]
	fn test_empty_document_yields_defaults() {
		let config: ResilienceConfig = serde_json::from_str("{}").unwrap();
		assert_eq!(config.retry.connection.max_attempts.get(), 5);
		assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(30));
	}

	#[test]
	fn test_yaml_round_trip_with_duration_strings() {
		let yaml = r#"
retry:
  connection:
    maxAttempts: 7
    initialDelay: 50ms
    maxDelay: 10s
circuitBreaker:
  name: orders-db
  failureThreshold: 4
  recoveryTimeout: 15s
twoPhase:
  participantTimeout: 2s
"#;
		let config: ResilienceConfig = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(config.retry.connection.max_attempts.get(), 7);
		assert_eq!(config.retry.connection.initial_delay, Duration::from_millis(50));
		assert_eq!(config.circuit_breaker.name, "orders-db");
		assert_eq!(config.circuit_breaker.failure_threshold, 4);
		assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(15));
		assert_eq!(config.two_phase.participant_timeout, Duration::from_secs(2));
		// Unconfigured sections keep their defaults.
		assert_eq!(config.retry.query.max_attempts.get(), 3);
		assert_eq!(config.two_phase.max_commit_retries, 2);

		let serialized = serde_yaml::to_string(&config).unwrap();
		let reparsed: ResilienceConfig = serde_yaml::from_str(&serialized).unwrap();
		assert_eq!(reparsed.retry, config.retry);
	}

	#[test]
	fn test_unknown_section_rejected() {
		let result: Result<ResilienceConfig, _> =
			serde_json::from_str(r#"{"bulkhead": {"maxConcurrent": 8}}"#);
		assert!(result.is_err());
	}
}
