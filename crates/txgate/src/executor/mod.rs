//! Retried execution of one logical unit of work against a single
//! participant's transactional boundary.
//!
//! The executor owns the attempt loop: each attempt invokes the caller's
//! operation afresh (a fresh transactional boundary - the participant is
//! never substituted mid-retry), races it against the configured timeout,
//! classifies failures through [`crate::retry::RetryPolicy`], and sleeps the
//! computed backoff between attempts. Callers get back a structured
//! [`TransactionResult`] rather than a bare `Result` so that upstream code
//! can distinguish retryable-exhausted from non-retryable failures without
//! re-parsing error text.

use std::fmt;
use std::future::Future;
use std::num::NonZeroU8;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::*;


/// The four standard SQL isolation levels.
///
/// Advisory only: the executor forwards the caller's choice through
/// [`TransactionOptions`], it never interprets it. Participants that have no
/// notion of isolation (a cache, say) ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub enum IsolationLevel {
	ReadUncommitted,
	#[default]
	ReadCommitted,
	RepeatableRead,
	Serializable,
}

/// Per-call options for a transactional execution. Every field has a
/// default; `retry_attempts`/`retry_delay` override the executor's own
/// retry configuration for this call only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub struct TransactionOptions {
	/// Bound for each individual attempt
	#[serde(default = "default_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub timeout: Duration,

	/// Advisory isolation level, passed through to the participant
	#[serde(default)]
	pub isolation: IsolationLevel,

	/// How long the participant may wait for a connection, passed through
	#[serde(default = "default_max_wait", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub max_wait: Duration,

	/// Override the executor's attempt budget for this call
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry_attempts: Option<NonZeroU8>,

	/// Override the executor's initial retry delay for this call
	#[serde(
		default,
		skip_serializing_if = "Option::is_none",
		with = "serde_dur_option"
	)]
	#[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
	pub retry_delay: Option<Duration>,
}

fn default_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_max_wait() -> Duration {
	Duration::from_secs(5)
}

impl Default for TransactionOptions {
	fn default() -> Self {
		Self {
			timeout: default_timeout(),
			isolation: IsolationLevel::default(),
			max_wait: default_max_wait(),
			retry_attempts: None,
			retry_delay: None,
		}
	}
}

/// What a logged operation did to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
	Create,
	Update,
	Delete,
	Read,
}

/// One entry in a transaction's operation log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOperation {
	/// Operation name, e.g. "insert_order"
	pub name: String,
	/// Target table or collection
	pub target: String,
	pub kind: ActionKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub entity_id: Option<String>,
	pub at: DateTime<Utc>,
	/// Free-form payload for audit/debugging
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<Value>,
}

impl TransactionOperation {
	pub fn new(name: impl Into<String>, target: impl Into<String>, kind: ActionKind) -> Self {
		Self {
			name: name.into(),
			target: target.into(),
			kind,
			entity_id: None,
			at: Utc::now(),
			details: None,
		}
	}

	pub fn entity(mut self, id: impl Into<String>) -> Self {
		self.entity_id = Some(id.into());
		self
	}

	pub fn details(mut self, details: Value) -> Self {
		self.details = Some(details);
		self
	}
}

/// Identity and append-only operation log for one logical transaction.
///
/// Created by the executor per [`TransactionExecutor::execute`] call and
/// shared with the operation closure; the log survives across retry
/// attempts so an aborted attempt's operations remain visible for audit.
pub struct TransactionContext {
	id: Uuid,
	started_at: DateTime<Utc>,
	operations: Mutex<Vec<TransactionOperation>>,
}

impl TransactionContext {
	fn new() -> Self {
		Self {
			id: Uuid::new_v4(),
			started_at: Utc::now(),
			operations: Mutex::new(Vec::new()),
		}
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}

	/// Append one operation to the log.
	pub fn record(&self, operation: TransactionOperation) {
		self.operations.lock().push(operation);
	}

	/// Snapshot of the log so far, in append order.
	pub fn operations(&self) -> Vec<TransactionOperation> {
		self.operations.lock().clone()
	}
}

impl fmt::Debug for TransactionContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TransactionContext")
			.field("id", &self.id)
			.field("started_at", &self.started_at)
			.field("operations", &self.operations.lock().len())
			.finish()
	}
}

/// Structured outcome of a transactional execution.
///
/// Exactly one of `result`/`error` is populated. `retry_count` is the number
/// of attempts consumed beyond the first.
#[derive(Debug)]
pub struct TransactionResult<T> {
	pub success: bool,
	pub result: Option<T>,
	pub error: Option<String>,
	pub retry_count: u32,
	pub duration: Duration,
}

impl<T> TransactionResult<T> {
	fn completed(value: T, retry_count: u32, duration: Duration) -> Self {
		Self {
			success: true,
			result: Some(value),
			error: None,
			retry_count,
			duration,
		}
	}

	fn failed(error: String, retry_count: u32, duration: Duration) -> Self {
		Self {
			success: false,
			result: None,
			error: Some(error),
			retry_count,
			duration,
		}
	}
}

/// Runs one logical unit of work with retry, timeout, and classification.
#[derive(Debug, Clone, Default)]
pub struct TransactionExecutor {
	policy: RetryPolicy,
}

impl TransactionExecutor {
	pub fn new(config: RetryConfig) -> Result<Self, InvalidRetryConfig> {
		Ok(Self {
			policy: RetryPolicy::new(config)?,
		})
	}

	pub fn with_policy(policy: RetryPolicy) -> Self {
		Self { policy }
	}

	/// Execute `operation`, retrying per policy.
	///
	/// The operation is invoked once per attempt and must open a fresh
	/// transactional boundary each time; it receives the shared
	/// [`TransactionContext`] for operation logging. Each attempt is raced
	/// against `options.timeout`; a timeout counts as a retryable failure.
	pub async fn execute<F, Fut, T, E>(
		&self,
		options: &TransactionOptions,
		operation: F,
	) -> TransactionResult<T>
	where
		F: Fn(Arc<TransactionContext>) -> Fut,
		Fut: Future<Output = Result<T, E>> + Send,
		E: fmt::Display,
	{
		let started = Instant::now();
		let ctx = Arc::new(TransactionContext::new());
		let policy = self.effective_policy(options);
		let mut attempt = 0u32;

		loop {
			attempt += 1;
			debug!(tx_id = %ctx.id(), attempt, "starting transaction attempt");

			let failure = match tokio::time::timeout(options.timeout, operation(ctx.clone())).await
			{
				Ok(Ok(value)) => {
					let duration = started.elapsed();
					info!(
						tx_id = %ctx.id(),
						retry_count = attempt - 1,
						duration = ?duration,
						"transaction completed"
					);
					return TransactionResult::completed(value, attempt - 1, duration);
				},
				Ok(Err(e)) => e.to_string(),
				Err(_) => format!("attempt timed out after {:?}", options.timeout),
			};

			match policy.decide(&failure, attempt) {
				RetryDecision::Retry { delay } => {
					warn!(
						tx_id = %ctx.id(),
						attempt,
						delay = ?delay,
						error = %failure,
						"transaction attempt failed, retrying"
					);
					tokio::time::sleep(delay).await;
				},
				RetryDecision::Stop => {
					let duration = started.elapsed();
					error!(
						tx_id = %ctx.id(),
						retry_count = attempt - 1,
						error = %failure,
						"transaction failed"
					);
					return TransactionResult::failed(failure, attempt - 1, duration);
				},
			}
		}
	}

	/// Per-call retry configuration: the executor's own, with any
	/// [`TransactionOptions`] overrides folded in.
	fn effective_policy(&self, options: &TransactionOptions) -> RetryPolicy {
		if options.retry_attempts.is_none() && options.retry_delay.is_none() {
			return self.policy.clone();
		}
		let mut config = self.policy.config().clone();
		if let Some(attempts) = options.retry_attempts {
			config.max_attempts = attempts;
		}
		if let Some(delay) = options.retry_delay {
			config.initial_delay = delay;
			// Preserve the initial <= max invariant for outsized overrides.
			config.max_delay = config.max_delay.max(delay);
		}
		RetryPolicy::unvalidated(config)
	}
}
