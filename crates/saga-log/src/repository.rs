use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;

use crate::{
    AvatarId, CommitOptions, CommitVersion, InstanceId, Result, SagaInstance, SagaLogError, SagaRef,
    SagaTransaction, SequenceNumber, TransactionDraft, TransactionId, TransactionQuery,
};

/// A transaction together with the instance it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedTransaction {
    pub instance_id: InstanceId,
    pub saga_ref: SagaRef,
    pub transaction: SagaTransaction,
}

/// A stream of logged transactions.
pub type TransactionStream = Pin<Box<dyn Stream<Item = Result<LoggedTransaction>> + Send>>;

/// The commit version a reader has consumed, per instance.
///
/// Commit versions only grow and each commit is atomic per instance, so
/// every transaction committed after a reader saw version `v` has a
/// `committed_in` greater than `v`. Absent instances have not been read.
pub type CommitCheckpoint = HashMap<InstanceId, CommitVersion>;

/// Storage contract for saga instances and their transaction logs.
///
/// Implementations must be thread-safe (Send + Sync). Sequence assignment,
/// commit and rollback are each atomic per instance. Nothing outside an
/// implementation's commit and rollback paths may change a transaction status.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Returns the single-player instance of `saga_ref` owned by `avatar_id`,
    /// creating it on first contact.
    async fn get_or_create_instance(
        &self,
        avatar_id: AvatarId,
        saga_ref: &SagaRef,
    ) -> Result<SagaInstance>;

    /// Returns the shared instance of `saga_ref`, creating it on first contact.
    async fn get_or_create_shared_instance(&self, saga_ref: &SagaRef) -> Result<SagaInstance>;

    /// Retrieves an instance by id.
    ///
    /// Returns None if the instance doesn't exist.
    async fn get_instance_by_id(&self, instance_id: InstanceId) -> Result<Option<SagaInstance>>;

    /// Appends drafts as pending transactions.
    ///
    /// The batch is appended atomically. Returns the assigned sequence numbers
    /// in draft order.
    async fn add_transactions(
        &self,
        instance_id: InstanceId,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<SequenceNumber>>;

    /// Retrieves every transaction of an instance in sequence order.
    async fn get_transactions(&self, instance_id: InstanceId) -> Result<Vec<SagaTransaction>>;

    /// Retrieves the transactions with a sequence number greater than `sequence`.
    async fn get_transactions_after_sequence(
        &self,
        instance_id: InstanceId,
        sequence: SequenceNumber,
    ) -> Result<Vec<SagaTransaction>>;

    /// Commits pending transactions.
    ///
    /// Returns `false` if a conflicting commit happened after
    /// `options.expected_commit_version`, in which case nothing changes.
    async fn commit_transactions(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
        options: CommitOptions,
    ) -> Result<bool>;

    /// Rolls back pending transactions. They stay in the log for audit.
    async fn rollback_transactions(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
    ) -> Result<()>;

    /// Retrieves instances owned by the avatar and shared instances the avatar
    /// has written to.
    async fn get_all_instances_for_avatar(&self, avatar_id: AvatarId) -> Result<Vec<SagaInstance>>;

    /// Retrieves transactions matching a query.
    async fn query_transactions(&self, query: TransactionQuery) -> Result<Vec<LoggedTransaction>>;

    /// Streams every committed transaction.
    ///
    /// Instances are visited in creation order, transactions in sequence order.
    async fn stream_committed_transactions(&self) -> Result<TransactionStream>;

    /// Streams the committed transactions `checkpoint` has not seen, in the
    /// same order as [`SagaRepository::stream_committed_transactions`].
    ///
    /// Instances whose commit version has not moved past their checkpoint
    /// are skipped without reading their logs.
    async fn stream_committed_since(
        &self,
        checkpoint: &CommitCheckpoint,
    ) -> Result<TransactionStream>;
}

/// Extension trait providing convenience methods for saga repositories.
#[async_trait]
pub trait SagaRepositoryExt: SagaRepository {
    /// Retrieves an instance, failing with `InstanceNotFound` if it doesn't exist.
    async fn require_instance(&self, instance_id: InstanceId) -> Result<SagaInstance> {
        self.get_instance_by_id(instance_id)
            .await?
            .ok_or(SagaLogError::InstanceNotFound(instance_id))
    }

    /// Appends a single draft.
    async fn add_transaction(
        &self,
        instance_id: InstanceId,
        draft: TransactionDraft,
    ) -> Result<SequenceNumber> {
        let mut sequences = self.add_transactions(instance_id, vec![draft]).await?;
        sequences.pop().ok_or(SagaLogError::EmptyBatch)
    }

    /// Commits without a concurrency check.
    async fn commit_unchecked(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
    ) -> Result<bool> {
        self.commit_transactions(instance_id, transaction_ids, CommitOptions::new())
            .await
    }
}

// Blanket implementation for all SagaRepository implementations
impl<T: SagaRepository + ?Sized> SagaRepositoryExt for T {}

/// Records the outcome of a commit call.
pub(crate) fn record_commit(instance_id: InstanceId, committed: bool) {
    if committed {
        metrics::counter!("saga_log_commits_total").increment(1);
    } else {
        metrics::counter!("saga_log_commit_conflicts_total").increment(1);
        tracing::debug!(%instance_id, "commit rejected by conflict check");
    }
}
