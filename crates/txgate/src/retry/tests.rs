use std::num::NonZeroU8;
use std::time::Duration;

use super::*;

fn policy(config: RetryConfig) -> RetryPolicy {
	RetryPolicy::new(config).unwrap()
}

fn attempts(n: u8) -> NonZeroU8 {
	NonZeroU8::new(n).unwrap()
}

// =============================================================================
// Config serialization/deserialization
// =============================================================================

#[test]
fn test_config_defaults() {
	let config = RetryConfig::default();
	assert_eq!(config.max_attempts.get(), 3);
	assert_eq!(config.initial_delay, Duration::from_millis(100));
	assert_eq!(config.max_delay, Duration::from_secs(2));
	assert_eq!(config.backoff_multiplier, 2.0);
	assert!(config.retryable_errors.is_none());
	assert!(!config.non_retryable_errors.is_empty());
}

#[test]
fn test_config_duration_strings() {
	let json = r#"{"maxAttempts": 5, "initialDelay": "250ms", "maxDelay": "10s"}"#;
	let config: RetryConfig = serde_json::from_str(json).unwrap();
	assert_eq!(config.max_attempts.get(), 5);
	assert_eq!(config.initial_delay, Duration::from_millis(250));
	assert_eq!(config.max_delay, Duration::from_secs(10));
}

#[test]
fn test_config_zero_attempts_rejected() {
	let json = r#"{"maxAttempts": 0}"#;
	let result: Result<RetryConfig, _> = serde_json::from_str(json);
	assert!(result.is_err());
}

#[test]
fn test_config_denies_unknown_fields() {
	let json = r#"{"maxAttempts": 2, "unknownField": true}"#;
	let result: Result<RetryConfig, _> = serde_json::from_str(json);
	assert!(result.is_err());
}

#[test]
fn test_config_serialize_roundtrip() {
	let config = RetryConfig {
		max_attempts: attempts(4),
		initial_delay: Duration::from_millis(50),
		max_delay: Duration::from_secs(1),
		backoff_multiplier: 1.5,
		retryable_errors: Some(vec!["timeout".to_string()]),
		non_retryable_errors: vec!["syntax error".to_string()],
	};
	let json = serde_json::to_string(&config).unwrap();
	let parsed: RetryConfig = serde_json::from_str(&json).unwrap();
	assert_eq!(parsed, config);
}

#[test]
fn test_validate_rejects_inverted_delays() {
	let config = RetryConfig {
		initial_delay: Duration::from_secs(5),
		max_delay: Duration::from_secs(1),
		..RetryConfig::default()
	};
	assert!(config.validate().is_err());
	assert!(RetryPolicy::new(config).is_err());
}

// =============================================================================
// Classification
// =============================================================================

#[test]
fn test_deny_list_wins_over_allow_list() {
	let policy = policy(RetryConfig {
		retryable_errors: Some(vec!["constraint".to_string()]),
		non_retryable_errors: vec!["constraint violation".to_string()],
		..RetryConfig::default()
	});
	assert_eq!(
		policy.classify("constraint violation on orders.sku"),
		ErrorClass::NonRetryable
	);
}

#[test]
fn test_retryable_by_default_without_allow_list() {
	let policy = policy(RetryConfig::default());
	assert_eq!(
		policy.classify("some backend exploded in a novel way"),
		ErrorClass::Retryable
	);
}

#[test]
fn test_allow_list_excludes_unmatched() {
	let policy = policy(RetryConfig {
		retryable_errors: Some(vec!["connection refused".to_string()]),
		..RetryConfig::default()
	});
	assert_eq!(
		policy.classify("ECONNREFUSED: connection refused"),
		ErrorClass::Retryable
	);
	assert_eq!(
		policy.classify("disk quota exceeded"),
		ErrorClass::NonRetryable
	);
}

#[test]
fn test_classification_is_case_insensitive() {
	let policy = policy(RetryConfig::default());
	assert_eq!(
		policy.classify("SYNTAX ERROR at or near SELECT"),
		ErrorClass::NonRetryable
	);
}

#[test]
fn test_classification_is_idempotent() {
	// Pure decision logic: same input, same answer, no hidden state.
	let policy = policy(RetryConfig::default());
	let first = policy.classify("connection reset by peer");
	let second = policy.classify("connection reset by peer");
	assert_eq!(first, second);

	let d1 = matches!(policy.decide("duplicate key", 1), RetryDecision::Stop);
	let d2 = matches!(policy.decide("duplicate key", 1), RetryDecision::Stop);
	assert_eq!(d1, d2);
}

// =============================================================================
// Decisions and backoff
// =============================================================================

#[test]
fn test_never_retries_past_max_attempts() {
	let policy = policy(RetryConfig {
		max_attempts: attempts(3),
		..RetryConfig::default()
	});
	assert!(matches!(
		policy.decide("timeout", 1),
		RetryDecision::Retry { .. }
	));
	assert!(matches!(
		policy.decide("timeout", 2),
		RetryDecision::Retry { .. }
	));
	assert_eq!(policy.decide("timeout", 3), RetryDecision::Stop);
	assert_eq!(policy.decide("timeout", 4), RetryDecision::Stop);
}

#[test]
fn test_non_retryable_stops_on_first_attempt() {
	let policy = policy(RetryConfig {
		max_attempts: attempts(5),
		..RetryConfig::default()
	});
	assert_eq!(policy.decide("unauthorized", 1), RetryDecision::Stop);
}

#[test]
fn test_single_attempt_config_never_retries() {
	let policy = policy(RetryConfig {
		max_attempts: attempts(1),
		..RetryConfig::default()
	});
	assert_eq!(policy.decide("timeout", 1), RetryDecision::Stop);
}

#[test]
fn test_backoff_delay_bounds() {
	let initial = Duration::from_millis(100);
	let max = Duration::from_secs(60);
	let policy = policy(RetryConfig {
		max_attempts: attempts(8),
		initial_delay: initial,
		max_delay: max,
		backoff_multiplier: 2.0,
		..RetryConfig::default()
	});

	// delay <= max_delay always; delay >= 0.5 * initial * 2^(attempt-1)
	// while the base stays under the cap (jitter lower bound).
	for attempt in 1..=6u32 {
		let base = initial.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
		for _ in 0..50 {
			let delay = policy.backoff_delay(attempt).as_secs_f64();
			assert!(delay <= max.as_secs_f64(), "attempt {attempt}: {delay} over cap");
			assert!(
				delay >= 0.5 * base - 1e-9,
				"attempt {attempt}: {delay} under jitter floor {}",
				0.5 * base
			);
			assert!(delay <= base + 1e-9, "attempt {attempt}: {delay} over base {base}");
		}
	}
}

#[test]
fn test_backoff_delay_capped_at_max() {
	let policy = policy(RetryConfig {
		max_attempts: attempts(20),
		initial_delay: Duration::from_millis(500),
		max_delay: Duration::from_secs(2),
		backoff_multiplier: 10.0,
		..RetryConfig::default()
	});
	for _ in 0..50 {
		let delay = policy.backoff_delay(12);
		assert!(delay <= Duration::from_secs(2));
	}
}
