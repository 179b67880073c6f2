//! Unit-of-work batching: ordered actions with compensating rollbacks,
//! committed as one executor-managed unit.
//!
//! Within-boundary atomicity belongs to the participant's transaction; the
//! rollback layer here is best-effort cleanup for state *outside* that
//! boundary (cache fills, published events, uploaded blobs). Rollbacks run
//! inside the failing attempt, before the executor decides whether to
//! retry, so a retried attempt starts from a compensated slate rather than
//! stacking side effects. Rollback failures are logged, never propagated -
//! the action's error is the root cause and must survive.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::*;

#[cfg(test)]
mod tests;

type ActionFn = Box<dyn Fn() -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;
type RollbackFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// One batched action with its optional compensating rollback.
pub struct BatchOperation {
	name: String,
	action: ActionFn,
	rollback: Option<RollbackFn>,
}

impl BatchOperation {
	pub fn name(&self) -> &str {
		&self.name
	}
}

/// Accumulates an ordered batch of (action, rollback?) pairs and commits
/// them as one [`TransactionExecutor`]-managed unit.
pub struct UnitOfWork {
	executor: TransactionExecutor,
	operations: Vec<BatchOperation>,
}

impl UnitOfWork {
	pub fn new(executor: TransactionExecutor) -> Self {
		Self {
			executor,
			operations: Vec::new(),
		}
	}

	/// Append an action with no rollback.
	pub fn add<F, Fut>(&mut self, name: impl Into<String>, action: F) -> &mut Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
	{
		self.operations.push(BatchOperation {
			name: name.into(),
			action: Box::new(move || Box::pin(action())),
			rollback: None,
		});
		self
	}

	/// Append an action and the rollback that undoes its external side
	/// effects.
	pub fn add_with_rollback<F, Fut, R, RFut>(
		&mut self,
		name: impl Into<String>,
		action: F,
		rollback: R,
	) -> &mut Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
		R: Fn() -> RFut + Send + Sync + 'static,
		RFut: Future<Output = Result<(), BoxError>> + Send + 'static,
	{
		self.operations.push(BatchOperation {
			name: name.into(),
			action: Box::new(move || Box::pin(action())),
			rollback: Some(Box::new(move || Box::pin(rollback()))),
		});
		self
	}

	pub fn len(&self) -> usize {
		self.operations.len()
	}

	pub fn is_empty(&self) -> bool {
		self.operations.is_empty()
	}

	/// Drop all accumulated operations so the unit can be reused.
	pub fn clear(&mut self) {
		self.operations.clear();
	}

	/// Run every action in insertion order as one retryable unit.
	///
	/// On success the result carries each action's output, in order. If an
	/// action fails, rollbacks registered for the actions that did run
	/// execute in reverse order before the attempt reports its error.
	pub async fn commit(&self, options: &TransactionOptions) -> TransactionResult<Vec<Value>> {
		self.executor
			.execute(options, |ctx| self.run_all(ctx))
			.await
	}

	async fn run_all(&self, _ctx: Arc<TransactionContext>) -> Result<Vec<Value>, BoxError> {
		let mut results = Vec::with_capacity(self.operations.len());
		for (index, operation) in self.operations.iter().enumerate() {
			match (operation.action)().await {
				Ok(value) => {
					debug!(operation = %operation.name, index, "batch operation completed");
					results.push(value);
				},
				Err(e) => {
					warn!(
						operation = %operation.name,
						index,
						error = %e,
						"batch operation failed, rolling back completed operations"
					);
					self.rollback_completed(&self.operations[..index]).await;
					return Err(e);
				},
			}
		}
		Ok(results)
	}

	/// Run rollbacks for the completed slice, last first. Failures are
	/// logged and skipped; the triggering error is what propagates.
	async fn rollback_completed(&self, completed: &[BatchOperation]) {
		for operation in completed.iter().rev() {
			let Some(rollback) = &operation.rollback else {
				debug!(operation = %operation.name, "no rollback registered, skipping");
				continue;
			};
			match rollback().await {
				Ok(()) => debug!(operation = %operation.name, "rollback completed"),
				Err(e) => error!(
					operation = %operation.name,
					error = %e,
					"rollback failed (continuing with remaining rollbacks)"
				),
			}
		}
	}
}
