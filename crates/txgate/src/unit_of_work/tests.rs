use std::num::NonZeroU8;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::*;
use crate::BoxError;

fn options() -> TransactionOptions {
	TransactionOptions {
		retry_attempts: NonZeroU8::new(2),
		retry_delay: Some(Duration::from_millis(5)),
		..TransactionOptions::default()
	}
}

/// Records the order in which actions and rollbacks run.
#[derive(Default)]
struct CallLog(Mutex<Vec<String>>);

impl CallLog {
	fn push(&self, entry: impl Into<String>) {
		self.0.lock().push(entry.into());
	}

	fn entries(&self) -> Vec<String> {
		self.0.lock().clone()
	}
}

fn failing(message: &'static str) -> BoxError {
	message.into()
}

#[tokio::test]
async fn test_commit_runs_actions_in_insertion_order() {
	let log = Arc::new(CallLog::default());
	let executor = TransactionExecutor::default();
	let mut unit = UnitOfWork::new(executor);

	for name in ["a", "b", "c"] {
		let log = log.clone();
		unit.add(name, move || {
			let log = log.clone();
			async move {
				log.push(name);
				Ok(json!({"op": name}))
			}
		});
	}

	let result = unit.commit(&options()).await;
	assert!(result.success);
	assert_eq!(result.result.unwrap().len(), 3);
	assert_eq!(log.entries(), ["a", "b", "c"]);
}

#[tokio::test]
async fn test_rollbacks_run_in_reverse_order() {
	// Operations [A, B, C] with rollbacks [rA, rB] (C has none); C throws.
	// rB then rA must run, in that order, before the failure surfaces.
	let log = Arc::new(CallLog::default());
	let executor = TransactionExecutor::default();
	let mut unit = UnitOfWork::new(executor);

	for name in ["a", "b"] {
		let action_log = log.clone();
		let rollback_log = log.clone();
		unit.add_with_rollback(
			name,
			move || {
				let log = action_log.clone();
				async move {
					log.push(name);
					Ok(json!(name))
				}
			},
			move || {
				let log = rollback_log.clone();
				async move {
					log.push(format!("undo-{name}"));
					Ok(())
				}
			},
		);
	}
	unit.add("c", || async { Err(failing("constraint violation")) });

	let result = unit.commit(&options()).await;
	assert!(!result.success);
	assert!(result.error.unwrap().contains("constraint violation"));
	assert_eq!(log.entries(), ["a", "b", "undo-b", "undo-a"]);
}

#[tokio::test]
async fn test_rollback_failure_does_not_mask_action_error() {
	let log = Arc::new(CallLog::default());
	let executor = TransactionExecutor::default();
	let mut unit = UnitOfWork::new(executor);

	let first_undo = log.clone();
	unit.add_with_rollback(
		"first",
		|| async { Ok(json!(1)) },
		move || {
			let log = first_undo.clone();
			async move {
				log.push("undo-first");
				Ok(())
			}
		},
	);
	unit.add_with_rollback(
		"second",
		|| async { Ok(json!(2)) },
		|| async { Err(failing("undo exploded")) },
	);
	unit.add("third", || async { Err(failing("permission denied")) });

	let result = unit.commit(&options()).await;
	assert!(!result.success);
	// The action error propagates, not the rollback error...
	assert!(result.error.unwrap().contains("permission denied"));
	// ...and the rollback failure did not stop earlier rollbacks.
	assert_eq!(log.entries(), ["undo-first"]);
}

#[tokio::test]
async fn test_unit_is_retried_as_a_whole() {
	let attempts = Arc::new(AtomicU32::new(0));
	let log = Arc::new(CallLog::default());
	let executor = TransactionExecutor::default();
	let mut unit = UnitOfWork::new(executor);

	let rollback_log = log.clone();
	unit.add_with_rollback(
		"write",
		|| async { Ok(json!("written")) },
		move || {
			let log = rollback_log.clone();
			async move {
				log.push("undo-write");
				Ok(())
			}
		},
	);

	let counted = attempts.clone();
	unit.add("flaky", move || {
		let attempts = counted.clone();
		async move {
			if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
				Err(failing("connection reset"))
			} else {
				Ok(json!("ok"))
			}
		}
	});

	let result = unit.commit(&options()).await;
	assert!(result.success);
	assert_eq!(result.retry_count, 1);
	// The failed first attempt compensated "write" before the retry.
	assert_eq!(log.entries(), ["undo-write"]);
	assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_clear_resets_accumulated_operations() {
	let executor = TransactionExecutor::default();
	let mut unit = UnitOfWork::new(executor);
	unit.add("a", || async { Ok(json!(1)) });
	unit.add("b", || async { Ok(json!(2)) });
	assert_eq!(unit.len(), 2);

	unit.clear();
	assert!(unit.is_empty());

	let result = unit.commit(&options()).await;
	assert!(result.success);
	assert_eq!(result.result, Some(Vec::new()));
}
