//! Two-phase commit across independent in-process participants.
//!
//! The classic protocol: a prepare phase collects votes from every
//! participant, and only a unanimous yes enters the commit phase. A no
//! vote, error, or timeout during prepare aborts the whole transaction and
//! rolls back every participant that had already prepared. Once the commit
//! phase begins there is no way back: commit failures are retried, then
//! logged and reported, but already-committed participants are never rolled
//! back - rollback after commit has begun is undefined in the protocol.
//!
//! The coordinator keeps no durable record of votes or in-flight phase. A
//! coordinator crash between prepare and commit leaves participants
//! inconsistent with no recovery path; that limitation is inherent to this
//! single-process design and intentionally not papered over here.
//!
//! A manager is built per logical operation and consumed by
//! [`TwoPhaseCommitManager::execute`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::*;


/// One independent unit capable of preparing, committing, or rolling back
/// its portion of a distributed operation.
///
/// A participant is stateless from the coordinator's point of view between
/// prepare and commit/rollback: whatever internal state it needs to make
/// commit or rollback valid after a successful prepare is its own
/// responsibility.
#[async_trait]
pub trait TransactionParticipant: Send + Sync {
	/// Stable identifier used in logs and results.
	fn id(&self) -> &str;

	/// Phase 1: validate and stage changes. `Ok(true)` votes commit,
	/// `Ok(false)` votes abort.
	async fn prepare(&self) -> Result<bool, BoxError>;

	/// Phase 2: atomically apply the staged changes.
	async fn commit(&self) -> Result<(), BoxError>;

	/// Phase 2: discard the staged changes.
	async fn rollback(&self) -> Result<(), BoxError>;
}

/// Configuration for a two-phase commit execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[cfg_attr(feature = "schema", derive(crate::JsonSchema))]
pub struct TwoPhaseConfig {
	/// Bound for the whole protocol, checked before each prepare
	#[serde(default = "default_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub timeout: Duration,

	/// Bound for each individual participant call
	#[serde(default = "default_participant_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub participant_timeout: Duration,

	/// Commit-phase retries per participant, after the first failed attempt
	#[serde(default = "default_max_commit_retries")]
	pub max_commit_retries: u8,
}

fn default_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_participant_timeout() -> Duration {
	Duration::from_secs(5)
}

fn default_max_commit_retries() -> u8 {
	2
}

impl Default for TwoPhaseConfig {
	fn default() -> Self {
		Self {
			timeout: default_timeout(),
			participant_timeout: default_participant_timeout(),
			max_commit_retries: default_max_commit_retries(),
		}
	}
}

/// Errors that can occur during a two-phase commit.
#[derive(Debug, Error)]
pub enum TwoPhaseError {
	/// A participant voted no, failed, or timed out during prepare.
	/// Participants that had already prepared were rolled back, in the
	/// order they prepared.
	#[error("aborted during prepare: participant '{participant}': {reason}")]
	Aborted {
		participant: String,
		reason: String,
		rolled_back: Vec<String>,
		failed_rollbacks: Vec<String>,
	},

	/// The overall protocol timeout elapsed during the prepare phase.
	#[error("two-phase commit timed out after {elapsed:?} during prepare")]
	Timeout {
		elapsed: Duration,
		rolled_back: Vec<String>,
		failed_rollbacks: Vec<String>,
	},

	/// Some participants committed and a later one did not, even after
	/// retries. Committed participants are NOT rolled back; the caller is
	/// looking at a genuinely partial commit and must reconcile out of
	/// band.
	#[error(
		"partial commit: {} participants committed, {} failed",
		.committed.len(),
		.failed.len()
	)]
	PartialCommit {
		committed: Vec<String>,
		/// (participant id, final error) pairs
		failed: Vec<(String, String)>,
	},
}

/// Outcome of a fully successful two-phase commit.
#[derive(Debug)]
pub struct TwoPhaseResult {
	/// Participant ids in commit order
	pub committed: Vec<String>,
	/// Total protocol time
	pub duration: Duration,
}

/// Coordinates atomic commitment across N participants.
pub struct TwoPhaseCommitManager {
	config: TwoPhaseConfig,
	participants: Vec<Arc<dyn TransactionParticipant>>,
}

impl TwoPhaseCommitManager {
	pub fn new(config: TwoPhaseConfig) -> Self {
		Self {
			config,
			participants: Vec::new(),
		}
	}

	pub fn add_participant(&mut self, participant: Arc<dyn TransactionParticipant>) -> &mut Self {
		self.participants.push(participant);
		self
	}

	pub fn participant_count(&self) -> usize {
		self.participants.len()
	}

	/// Run the protocol to completion.
	pub async fn execute(self) -> Result<TwoPhaseResult, TwoPhaseError> {
		let start = Instant::now();
		info!(
			participant_count = self.participants.len(),
			"starting two-phase commit"
		);

		// Phase 1: collect votes in addition order.
		let mut prepared: Vec<&Arc<dyn TransactionParticipant>> = Vec::new();
		for participant in &self.participants {
			if start.elapsed() > self.config.timeout {
				warn!(
					elapsed = ?start.elapsed(),
					"protocol timeout elapsed during prepare, aborting"
				);
				let (rolled_back, failed_rollbacks) = self.rollback_prepared(&prepared).await;
				return Err(TwoPhaseError::Timeout {
					elapsed: start.elapsed(),
					rolled_back,
					failed_rollbacks,
				});
			}

			match self.call_prepare(participant.as_ref()).await {
				Ok(()) => {
					debug!(participant = participant.id(), "participant prepared");
					prepared.push(participant);
				},
				Err(reason) => {
					warn!(
						participant = participant.id(),
						reason = %reason,
						elapsed = ?start.elapsed(),
						"prepare failed, aborting"
					);
					let (rolled_back, failed_rollbacks) = self.rollback_prepared(&prepared).await;
					return Err(TwoPhaseError::Aborted {
						participant: participant.id().to_string(),
						reason,
						rolled_back,
						failed_rollbacks,
					});
				},
			}
		}

		// Phase 2: every participant voted yes. From here commit is pushed
		// toward completion; nothing is rolled back.
		let mut committed = Vec::new();
		let mut failed: Vec<(String, String)> = Vec::new();
		for participant in &self.participants {
			match self.call_commit(participant.as_ref()).await {
				Ok(()) => {
					debug!(participant = participant.id(), "participant committed");
					committed.push(participant.id().to_string());
				},
				Err(reason) => {
					error!(
						participant = participant.id(),
						error = %reason,
						"commit failed after retries; committed participants are not rolled back"
					);
					failed.push((participant.id().to_string(), reason));
				},
			}
		}

		let duration = start.elapsed();
		if failed.is_empty() {
			info!(duration = ?duration, "two-phase commit completed");
			Ok(TwoPhaseResult {
				committed,
				duration,
			})
		} else {
			error!(
				duration = ?duration,
				committed = committed.len(),
				failed = failed.len(),
				"two-phase commit left participants partially committed"
			);
			Err(TwoPhaseError::PartialCommit { committed, failed })
		}
	}

	/// One prepare call, bounded by the participant timeout. A timeout is
	/// treated identically to a no vote.
	async fn call_prepare(&self, participant: &dyn TransactionParticipant) -> Result<(), String> {
		match tokio::time::timeout(self.config.participant_timeout, participant.prepare()).await {
			Ok(Ok(true)) => Ok(()),
			Ok(Ok(false)) => Err("voted no".to_string()),
			Ok(Err(e)) => Err(e.to_string()),
			Err(_) => Err(format!(
				"prepare timed out after {:?}",
				self.config.participant_timeout
			)),
		}
	}

	/// One commit, retried up to `max_commit_retries` extra attempts. A
	/// timeout counts as a failed attempt.
	async fn call_commit(&self, participant: &dyn TransactionParticipant) -> Result<(), String> {
		let attempts = u32::from(self.config.max_commit_retries) + 1;
		let mut last_error = String::new();
		for attempt in 1..=attempts {
			match tokio::time::timeout(self.config.participant_timeout, participant.commit()).await
			{
				Ok(Ok(())) => return Ok(()),
				Ok(Err(e)) => last_error = e.to_string(),
				Err(_) => {
					last_error = format!(
						"commit timed out after {:?}",
						self.config.participant_timeout
					);
				},
			}
			if attempt < attempts {
				warn!(
					participant = participant.id(),
					attempt,
					error = %last_error,
					"commit attempt failed, retrying"
				);
			}
		}
		Err(last_error)
	}

	/// Roll back prepared participants, in the order they prepared. Returns
	/// (rolled back, failed) id lists; failures are logged and never mask
	/// the abort cause.
	async fn rollback_prepared(
		&self,
		prepared: &[&Arc<dyn TransactionParticipant>],
	) -> (Vec<String>, Vec<String>) {
		let mut rolled_back = Vec::new();
		let mut failed = Vec::new();
		for participant in prepared {
			let outcome =
				tokio::time::timeout(self.config.participant_timeout, participant.rollback())
					.await;
			match outcome {
				Ok(Ok(())) => {
					info!(participant = participant.id(), "participant rolled back");
					rolled_back.push(participant.id().to_string());
				},
				Ok(Err(e)) => {
					error!(
						participant = participant.id(),
						error = %e,
						"rollback failed (continuing with remaining rollbacks)"
					);
					failed.push(participant.id().to_string());
				},
				Err(_) => {
					error!(
						participant = participant.id(),
						"rollback timed out (continuing with remaining rollbacks)"
					);
					failed.push(participant.id().to_string());
				},
			}
		}
		(rolled_back, failed)
	}
}
