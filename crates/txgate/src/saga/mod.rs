//! Saga orchestration for workflows spanning participants that do not
//! share one transactional boundary.
//!
//! Each step commits independently and registers a compensation that
//! semantically undoes it. If a step's action fails, compensation runs for
//! every previously successful step in reverse order, each receiving the
//! result its action recorded. The failing step itself is never
//! compensated - it never completed. Compensation failures are logged and
//! reported in the error's diagnostics, but they never replace the original
//! failure and never abort the remaining compensations.
//!
//! A `SagaManager` is built per logical operation and consumed by
//! [`SagaManager::execute`]; it is not reused.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::*;


type StepAction = Box<dyn Fn() -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;
type StepCompensation = Box<dyn Fn(Value) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Errors that can occur during saga execution.
///
/// `failed_compensations` carries the names of completed steps whose
/// compensation failed, so callers can see what was left dangling without
/// the cleanup failure masking the root cause.
#[derive(Debug, Error)]
pub enum SagaError {
	#[error("step '{step}' failed: {message}")]
	StepFailed {
		step: String,
		message: String,
		failed_compensations: Vec<String>,
	},

	#[error("saga timed out after {elapsed:?}")]
	Timeout {
		elapsed: Duration,
		failed_compensations: Vec<String>,
	},
}

/// Result of one completed step.
#[derive(Debug, Clone)]
pub struct StepResult {
	pub name: String,
	pub output: Value,
	pub duration: Duration,
}

/// Result of a successful saga execution.
#[derive(Debug)]
pub struct SagaResult {
	/// Step results in execution (insertion) order
	pub steps: Vec<StepResult>,
	/// Total execution time
	pub duration: Duration,
}

/// A single step: an action that commits independently, and the
/// compensation that undoes it.
pub struct SagaStep {
	name: String,
	action: StepAction,
	compensation: Option<StepCompensation>,
	timeout: Option<Duration>,
}

impl SagaStep {
	pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
	{
		Self {
			name: name.into(),
			action: Box::new(move || Box::pin(action())),
			compensation: None,
			timeout: None,
		}
	}

	/// Attach the compensating action. It receives the result recorded by
	/// this step's action.
	pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
	where
		F: Fn(Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
	{
		self.compensation = Some(Box::new(move |result| Box::pin(compensation(result))));
		self
	}

	/// Per-step timeout; overrides the saga-wide timeout for this step.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

/// Orchestrates an ordered list of independently-committing steps.
pub struct SagaManager {
	name: String,
	steps: Vec<SagaStep>,
	timeout: Option<Duration>,
}

impl SagaManager {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			steps: Vec::new(),
			timeout: None,
		}
	}

	/// Overall timeout for the whole saga, checked between steps and used
	/// as the default bound for each step's action.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn add_step(&mut self, step: SagaStep) -> &mut Self {
		self.steps.push(step);
		self
	}

	pub fn step_count(&self) -> usize {
		self.steps.len()
	}

	/// Run the saga to completion.
	///
	/// Steps run in insertion order; a result is recorded only after the
	/// step's action succeeds. On any failure, completed steps are
	/// compensated in reverse order and the first action error is returned.
	pub async fn execute(self) -> Result<SagaResult, SagaError> {
		let start = Instant::now();
		info!(
			saga = %self.name,
			step_count = self.steps.len(),
			"starting saga execution"
		);

		let mut completed: Vec<StepResult> = Vec::new();

		for (index, step) in self.steps.iter().enumerate() {
			if let Some(timeout) = self.timeout
				&& start.elapsed() > timeout
			{
				warn!(
					saga = %self.name,
					elapsed = ?start.elapsed(),
					"saga timed out, compensating completed steps"
				);
				let failed = self.compensate(&self.steps[..index], &completed).await;
				return Err(SagaError::Timeout {
					elapsed: start.elapsed(),
					failed_compensations: failed,
				});
			}

			debug!(step = %step.name, index, "executing step");
			let step_start = Instant::now();
			let step_timeout = step.timeout.or(self.timeout);

			match run_bounded(&step.action, step_timeout).await {
				Ok(output) => {
					let duration = step_start.elapsed();
					info!(step = %step.name, duration = ?duration, "step completed");
					completed.push(StepResult {
						name: step.name.clone(),
						output,
						duration,
					});
				},
				Err(message) => {
					error!(
						step = %step.name,
						error = %message,
						"step failed, starting compensation"
					);
					let failed = self.compensate(&self.steps[..index], &completed).await;
					return Err(SagaError::StepFailed {
						step: step.name.clone(),
						message,
						failed_compensations: failed,
					});
				},
			}
		}

		let duration = start.elapsed();
		info!(saga = %self.name, duration = ?duration, "saga completed");
		Ok(SagaResult {
			steps: completed,
			duration,
		})
	}

	/// Compensate completed steps in reverse order, passing each step's
	/// recorded result. Returns the names of steps whose compensation
	/// failed; failures never abort the remaining compensations.
	async fn compensate(&self, completed_steps: &[SagaStep], results: &[StepResult]) -> Vec<String> {
		info!(
			saga = %self.name,
			step_count = completed_steps.len(),
			"compensating completed steps"
		);
		let mut failed = Vec::new();

		for (step, result) in completed_steps.iter().zip(results).rev() {
			let Some(compensation) = &step.compensation else {
				debug!(step = %step.name, "no compensation registered, skipping");
				continue;
			};
			let bound = step.timeout.or(self.timeout);
			let outcome = match bound {
				Some(dur) => match tokio::time::timeout(dur, compensation(result.output.clone())).await {
					Ok(r) => r,
					Err(_) => Err(format!("compensation timed out after {dur:?}").into()),
				},
				None => compensation(result.output.clone()).await,
			};
			match outcome {
				Ok(()) => info!(step = %step.name, "compensation completed"),
				Err(e) => {
					error!(
						step = %step.name,
						error = %e,
						"compensation failed (continuing with remaining compensations)"
					);
					failed.push(step.name.clone());
				},
			}
		}
		failed
	}
}

/// Run a step action, bounded by its timeout when one applies. A timeout is
/// reported the same way as a returned failure.
async fn run_bounded(action: &StepAction, timeout: Option<Duration>) -> Result<Value, String> {
	match timeout {
		Some(dur) => match tokio::time::timeout(dur, action()).await {
			Ok(result) => result.map_err(|e| e.to_string()),
			Err(_) => Err(format!("timed out after {dur:?}")),
		},
		None => action().await.map_err(|e| e.to_string()),
	}
}
