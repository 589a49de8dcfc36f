//! Command handling infrastructure.

use std::sync::Arc;

use common::InstanceId;
use saga_log::{
    CommitOptions, ConflictRule, SagaInstance, SagaRepository, SagaRepositoryExt,
    SequenceNumber, TransactionDraft, TransactionId,
};

use crate::error::{CommandFailure, Result};
use crate::machine::SagaStateMachine;
use crate::state::SagaState;
use crate::template::TemplateCatalog;

/// Number of commit attempts a command makes before reporting a conflict.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Reason a decision function refuses a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(String);

impl Rejection {
    /// Creates a rejection with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// Returns the reason.
    pub fn reason(&self) -> &str {
        &self.0
    }
}

/// Result of command execution.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub instance_id: InstanceId,

    /// The transactions that were committed. Empty if the command had nothing to do.
    pub transaction_ids: Vec<TransactionId>,

    /// The sequence numbers the committed transactions received.
    pub sequence_numbers: Vec<SequenceNumber>,

    /// Saga state after the commit.
    pub state: SagaState,

    /// Number of commit attempts used.
    pub attempts: u32,
}

impl CommandOutcome {
    /// Returns true if the command committed any transaction.
    pub fn is_noop(&self) -> bool {
        self.transaction_ids.is_empty()
    }
}

/// Handler for executing commands against saga instances.
///
/// Each attempt:
/// 1. Loads the instance and replays it with its template
/// 2. Asks the decision function for drafts
/// 3. Checks the drafts replay cleanly on top of the current state
/// 4. Appends them and commits against the commit version that was read
///
/// A lost commit race rolls the batch back, so nothing stays pending, and
/// the command starts over from a fresh read.
pub struct SagaCommandHandler<R: SagaRepository> {
    repository: R,
    catalog: Arc<TemplateCatalog>,
    max_commit_attempts: u32,
}

impl<R: SagaRepository + Clone + 'static> SagaCommandHandler<R> {
    /// Creates a new command handler.
    pub fn new(repository: R, catalog: Arc<TemplateCatalog>) -> Self {
        Self {
            repository,
            catalog,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }

    /// Sets how many times a command may lose a commit race. At least one attempt is made.
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    /// Returns a reference to the underlying repository.
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Returns the template catalog.
    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Returns the maximum number of commit attempts.
    pub fn max_commit_attempts(&self) -> u32 {
        self.max_commit_attempts
    }

    /// Returns a state machine for the instance's template.
    pub fn machine_for(&self, instance: &SagaInstance) -> Result<SagaStateMachine<'_>> {
        let template = self.catalog.require(instance.saga_ref())?;
        Ok(SagaStateMachine::new(template))
    }

    /// Loads an instance and replays its committed log.
    pub async fn load(&self, instance_id: InstanceId) -> Result<(SagaInstance, SagaState)> {
        let instance = self.repository.require_instance(instance_id).await?;
        let state = self.machine_for(&instance)?.replay_to_now(&instance)?;
        Ok((instance, state))
    }

    /// Executes a command where every intervening commit is a conflict.
    pub async fn execute<F>(&self, instance_id: InstanceId, decide: F) -> Result<CommandOutcome>
    where
        F: Fn(&SagaState) -> std::result::Result<Vec<TransactionDraft>, Rejection> + Send + Sync,
    {
        self.execute_with_rule(instance_id, None, decide).await
    }

    /// Executes a command, using `conflict_rule` to decide which intervening
    /// commits invalidate it.
    ///
    /// The decision function may run once per attempt and must build fresh
    /// drafts each time.
    pub async fn execute_with_rule<F>(
        &self,
        instance_id: InstanceId,
        conflict_rule: Option<Arc<dyn ConflictRule>>,
        decide: F,
    ) -> Result<CommandOutcome>
    where
        F: Fn(&SagaState) -> std::result::Result<Vec<TransactionDraft>, Rejection> + Send + Sync,
    {
        for attempt in 1..=self.max_commit_attempts {
            let instance = self.repository.require_instance(instance_id).await?;
            let machine = self.machine_for(&instance)?;
            let state = machine.replay_to_now(&instance)?;

            let drafts = decide(&state)
                .map_err(|rejection| CommandFailure::validation(instance_id, rejection.0))?;
            if drafts.is_empty() {
                return Ok(CommandOutcome {
                    instance_id,
                    transaction_ids: Vec::new(),
                    sequence_numbers: Vec::new(),
                    state,
                    attempts: attempt,
                });
            }

            let previewed = machine
                .preview(&state, &drafts)
                .map_err(|e| CommandFailure::validation(instance_id, e.to_string()))?;

            let transaction_ids: Vec<_> = drafts.iter().map(|d| d.transaction_id).collect();
            let options = CommitOptions {
                expected_commit_version: Some(instance.commit_version()),
                conflict_rule: conflict_rule.clone(),
            };

            // Settled in its own task so a dropped caller cannot strand the batch as Pending.
            let (sequence_numbers, committed) = tokio::spawn(settle_batch(
                self.repository.clone(),
                instance_id,
                drafts,
                options,
            ))
            .await??;

            if committed {
                metrics::counter!("saga_commands_committed_total").increment(1);
                let state = match self.load(instance_id).await {
                    Ok((_, state)) => state,
                    Err(err) => {
                        tracing::error!(%instance_id, error = %err, "committed log no longer replays");
                        previewed
                    }
                };
                return Ok(CommandOutcome {
                    instance_id,
                    transaction_ids,
                    sequence_numbers,
                    state,
                    attempts: attempt,
                });
            }

            metrics::counter!("saga_command_retries_total").increment(1);
            tracing::warn!(%instance_id, attempt, "commit conflict, retrying with a fresh read");
        }

        metrics::counter!("saga_commands_conflicted_total").increment(1);
        Err(CommandFailure::conflict(
            instance_id,
            format!(
                "lost {} consecutive commit races",
                self.max_commit_attempts
            ),
        )
        .into())
    }
}

/// Appends a batch and commits it, rolling it back if the commit loses.
///
/// Returns the assigned sequence numbers and whether the batch committed.
/// A batch that is not committed is never left Pending.
async fn settle_batch<R: SagaRepository>(
    repository: R,
    instance_id: InstanceId,
    drafts: Vec<TransactionDraft>,
    options: CommitOptions,
) -> Result<(Vec<SequenceNumber>, bool)> {
    let transaction_ids: Vec<_> = drafts.iter().map(|d| d.transaction_id).collect();
    let sequence_numbers = repository.add_transactions(instance_id, drafts).await?;

    let committed = match repository
        .commit_transactions(instance_id, &transaction_ids, options)
        .await
    {
        Ok(committed) => committed,
        Err(err) => {
            if let Err(rollback_err) = repository
                .rollback_transactions(instance_id, &transaction_ids)
                .await
            {
                tracing::error!(%instance_id, error = %rollback_err, "failed to roll back batch after commit error");
            }
            return Err(err.into());
        }
    };

    if !committed {
        repository
            .rollback_transactions(instance_id, &transaction_ids)
            .await?;
    }
    Ok((sequence_numbers, committed))
}
