//! Saga instance aggregate: one ordered transaction log per instance.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction::to_storage_precision;
use crate::{
    AvatarId, CommitVersion, InstanceId, Result, SagaLogError, SagaRef, SagaTransaction,
    SequenceNumber, TransactionDraft, TransactionId, TransactionStatus,
};

/// Whether an instance belongs to one avatar or is shared by everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceType {
    /// Private to its owning avatar.
    SinglePlayer,

    /// One instance per saga, written by any number of avatars.
    SharedMultiplayer,
}

impl InstanceType {
    /// Returns the type name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SinglePlayer => "SinglePlayer",
            Self::SharedMultiplayer => "SharedMultiplayer",
        }
    }

    /// Parses a type name produced by [`Self::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SinglePlayer" => Some(Self::SinglePlayer),
            "SharedMultiplayer" => Some(Self::SharedMultiplayer),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied business rule deciding whether a transaction committed by
/// someone else since the caller read the log invalidates the caller's batch.
pub trait ConflictRule: Send + Sync {
    /// Returns true if `committed` conflicts with the batch about to be committed.
    fn conflicts(&self, committed: &SagaTransaction, batch: &[&SagaTransaction]) -> bool;
}

impl<F> ConflictRule for F
where
    F: Fn(&SagaTransaction, &[&SagaTransaction]) -> bool + Send + Sync,
{
    fn conflicts(&self, committed: &SagaTransaction, batch: &[&SagaTransaction]) -> bool {
        self(committed, batch)
    }
}

/// Options for committing a batch of pending transactions.
#[derive(Clone, Default)]
pub struct CommitOptions {
    /// Commit version the caller observed when it read the log.
    /// If None, no concurrency check is performed.
    pub expected_commit_version: Option<CommitVersion>,

    /// Decides which intervening commits conflict. If None, every
    /// intervening commit is a conflict.
    pub conflict_rule: Option<Arc<dyn ConflictRule>>,
}

impl CommitOptions {
    /// Creates options with no concurrency check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting no commit to have happened after `version`.
    pub fn expect_commit_version(version: CommitVersion) -> Self {
        Self {
            expected_commit_version: Some(version),
            conflict_rule: None,
        }
    }

    /// Narrows the concurrency check to the transactions `rule` flags.
    pub fn with_conflict_rule(mut self, rule: impl ConflictRule + 'static) -> Self {
        self.conflict_rule = Some(Arc::new(rule));
        self
    }
}

impl std::fmt::Debug for CommitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitOptions")
            .field("expected_commit_version", &self.expected_commit_version)
            .field("conflict_rule", &self.conflict_rule.is_some())
            .finish()
    }
}

/// An instance of a saga template and its transaction log.
///
/// The log keeps every transaction ever appended, whatever its status.
/// Rolled-back and pending transactions stay in the log for audit but are
/// invisible to [`SagaInstance::committed_transactions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaInstance {
    instance_id: InstanceId,
    saga_ref: SagaRef,
    instance_type: InstanceType,
    owner_avatar_id: Option<AvatarId>,
    created_at: DateTime<Utc>,
    transactions: Vec<SagaTransaction>,
    next_sequence_number: SequenceNumber,
    commit_version: CommitVersion,
}

impl SagaInstance {
    /// Creates an empty instance owned by one avatar.
    pub fn single_player(owner: AvatarId, saga_ref: SagaRef) -> Self {
        Self::new(InstanceId::new(), saga_ref, InstanceType::SinglePlayer, Some(owner))
    }

    /// Creates an empty shared instance.
    pub fn shared(saga_ref: SagaRef) -> Self {
        Self::new(InstanceId::new(), saga_ref, InstanceType::SharedMultiplayer, None)
    }

    /// Creates an empty instance.
    pub fn new(
        instance_id: InstanceId,
        saga_ref: SagaRef,
        instance_type: InstanceType,
        owner_avatar_id: Option<AvatarId>,
    ) -> Self {
        Self {
            instance_id,
            saga_ref,
            instance_type,
            owner_avatar_id,
            created_at: to_storage_precision(Utc::now()),
            transactions: Vec::new(),
            next_sequence_number: SequenceNumber::first(),
            commit_version: CommitVersion::initial(),
        }
    }

    /// Rebuilds an instance from its stored representation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        instance_id: InstanceId,
        saga_ref: SagaRef,
        instance_type: InstanceType,
        owner_avatar_id: Option<AvatarId>,
        created_at: DateTime<Utc>,
        mut transactions: Vec<SagaTransaction>,
        next_sequence_number: SequenceNumber,
        commit_version: CommitVersion,
    ) -> Self {
        transactions.sort_by_key(|tx| tx.sequence_number());
        Self {
            instance_id,
            saga_ref,
            instance_type,
            owner_avatar_id,
            created_at,
            transactions,
            next_sequence_number,
            commit_version,
        }
    }

    /// Appends a draft as a pending transaction with the next sequence number.
    pub fn add_transaction(&mut self, draft: TransactionDraft) -> Result<SequenceNumber> {
        self.add_transaction_at(draft, Utc::now())
    }

    pub(crate) fn add_transaction_at(
        &mut self,
        draft: TransactionDraft,
        accepted_at: DateTime<Utc>,
    ) -> Result<SequenceNumber> {
        if self.transaction(draft.transaction_id).is_some() {
            return Err(SagaLogError::DuplicateTransaction {
                instance_id: self.instance_id,
                transaction_id: draft.transaction_id,
            });
        }

        let sequence_number = self.next_sequence_number;
        self.transactions
            .push(SagaTransaction::from_draft(draft, sequence_number, accepted_at));
        self.next_sequence_number = sequence_number.next();
        Ok(sequence_number)
    }

    /// Appends a batch of drafts. Either every draft is appended or none is.
    pub fn add_transactions(
        &mut self,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<SequenceNumber>> {
        if drafts.is_empty() {
            return Err(SagaLogError::EmptyBatch);
        }

        let mut seen = HashSet::new();
        for draft in &drafts {
            if !seen.insert(draft.transaction_id) || self.transaction(draft.transaction_id).is_some()
            {
                return Err(SagaLogError::DuplicateTransaction {
                    instance_id: self.instance_id,
                    transaction_id: draft.transaction_id,
                });
            }
        }

        let accepted_at = Utc::now();
        drafts
            .into_iter()
            .map(|draft| self.add_transaction_at(draft, accepted_at))
            .collect()
    }

    /// Flips pending transactions to `Committed` as one atomic step.
    ///
    /// Returns `Ok(false)` without touching anything if a conflicting
    /// transaction was committed after `options.expected_commit_version`.
    /// Ids that are already committed are skipped, so retrying a commit
    /// that already went through succeeds without re-applying anything.
    pub(crate) fn commit(
        &mut self,
        transaction_ids: &[TransactionId],
        options: &CommitOptions,
    ) -> Result<bool> {
        if transaction_ids.is_empty() {
            return Err(SagaLogError::EmptyBatch);
        }

        let mut to_commit = Vec::new();
        for &transaction_id in transaction_ids {
            let (index, tx) = self.locate(transaction_id)?;
            match tx.status() {
                TransactionStatus::Pending => {
                    if !to_commit.contains(&index) {
                        to_commit.push(index);
                    }
                }
                TransactionStatus::Committed => {}
                TransactionStatus::RolledBack => {
                    return Err(SagaLogError::InvalidStatusTransition {
                        transaction_id,
                        from: TransactionStatus::RolledBack,
                        to: TransactionStatus::Committed,
                    });
                }
            }
        }

        if to_commit.is_empty() {
            return Ok(true);
        }

        if let Some(expected) = options.expected_commit_version {
            if self.has_conflict(expected, &to_commit, options) {
                return Ok(false);
            }
        }

        let version = self.commit_version.next();
        for index in to_commit {
            self.transactions[index].mark_committed(version);
        }
        self.commit_version = version;
        Ok(true)
    }

    /// Flips pending transactions to `RolledBack`.
    ///
    /// Already rolled-back ids are skipped. A committed id is an error and
    /// nothing is rolled back.
    pub(crate) fn rollback(&mut self, transaction_ids: &[TransactionId]) -> Result<()> {
        if transaction_ids.is_empty() {
            return Err(SagaLogError::EmptyBatch);
        }

        let mut to_roll_back = Vec::new();
        for &transaction_id in transaction_ids {
            let (index, tx) = self.locate(transaction_id)?;
            match tx.status() {
                TransactionStatus::Pending => to_roll_back.push(index),
                TransactionStatus::RolledBack => {}
                TransactionStatus::Committed => {
                    return Err(SagaLogError::InvalidStatusTransition {
                        transaction_id,
                        from: TransactionStatus::Committed,
                        to: TransactionStatus::RolledBack,
                    });
                }
            }
        }

        for index in to_roll_back {
            self.transactions[index].mark_rolled_back();
        }
        Ok(())
    }

    fn has_conflict(
        &self,
        expected: CommitVersion,
        batch_indexes: &[usize],
        options: &CommitOptions,
    ) -> bool {
        let batch: Vec<&SagaTransaction> = batch_indexes
            .iter()
            .map(|&index| &self.transactions[index])
            .collect();

        self.transactions
            .iter()
            .filter(|tx| tx.committed_in().is_some_and(|v| v > expected))
            .any(|committed| match &options.conflict_rule {
                Some(rule) => rule.conflicts(committed, &batch),
                None => true,
            })
    }

    fn locate(&self, transaction_id: TransactionId) -> Result<(usize, &SagaTransaction)> {
        self.transactions
            .iter()
            .enumerate()
            .find(|(_, tx)| tx.transaction_id() == transaction_id)
            .ok_or(SagaLogError::TransactionNotFound {
                instance_id: self.instance_id,
                transaction_id,
            })
    }
}

// Query methods
impl SagaInstance {
    /// Returns the instance ID.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Returns the saga template this instance was created from.
    pub fn saga_ref(&self) -> &SagaRef {
        &self.saga_ref
    }

    /// Returns the instance type.
    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    /// Returns the owning avatar of a single-player instance.
    pub fn owner_avatar_id(&self) -> Option<AvatarId> {
        self.owner_avatar_id
    }

    /// Returns when the instance was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the sequence number the next append will receive.
    pub fn next_sequence_number(&self) -> SequenceNumber {
        self.next_sequence_number
    }

    /// Returns the number of commit batches applied so far.
    pub fn commit_version(&self) -> CommitVersion {
        self.commit_version
    }

    /// Returns every transaction in sequence order, whatever its status.
    pub fn transactions(&self) -> &[SagaTransaction] {
        &self.transactions
    }

    /// Returns the transactions with a sequence number greater than `sequence`.
    pub fn transactions_after(&self, sequence: SequenceNumber) -> &[SagaTransaction] {
        let start = self
            .transactions
            .partition_point(|tx| tx.sequence_number() <= sequence);
        &self.transactions[start..]
    }

    /// Returns the committed transactions in sequence order.
    pub fn committed_transactions(&self) -> impl Iterator<Item = &SagaTransaction> {
        self.transactions.iter().filter(|tx| tx.is_committed())
    }

    /// Returns the transactions still waiting for a commit or rollback.
    pub fn pending_transactions(&self) -> impl Iterator<Item = &SagaTransaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.status() == TransactionStatus::Pending)
    }

    /// Looks up a transaction by id.
    pub fn transaction(&self, transaction_id: TransactionId) -> Option<&SagaTransaction> {
        self.transactions
            .iter()
            .find(|tx| tx.transaction_id() == transaction_id)
    }

    /// Returns true if the avatar owns this single-player instance, or has
    /// authored a committed transaction in this shared instance.
    pub fn involves_avatar(&self, avatar_id: AvatarId) -> bool {
        match self.instance_type {
            InstanceType::SinglePlayer => self.owner_avatar_id == Some(avatar_id),
            InstanceType::SharedMultiplayer => self
                .transactions
                .iter()
                .any(|tx| tx.is_committed() && tx.avatar_id() == Some(avatar_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransactionKind, TransactionPayload};

    fn instance() -> SagaInstance {
        SagaInstance::shared(SagaRef::new("sunken_crypt"))
    }

    fn draft(payload: TransactionPayload) -> TransactionDraft {
        TransactionDraft::new(payload)
    }

    fn append(instance: &mut SagaInstance, payload: TransactionPayload) -> TransactionId {
        let draft = draft(payload);
        let id = draft.transaction_id;
        instance.add_transaction(draft).unwrap();
        id
    }

    #[test]
    fn new_instance_is_empty() {
        let instance = instance();
        assert!(instance.transactions().is_empty());
        assert_eq!(instance.next_sequence_number(), SequenceNumber::first());
        assert_eq!(instance.commit_version(), CommitVersion::initial());
        assert_eq!(instance.instance_type(), InstanceType::SharedMultiplayer);
    }

    #[test]
    fn append_assigns_increasing_sequence_numbers_as_pending() {
        let mut instance = instance();

        let first = instance
            .add_transaction(draft(TransactionPayload::SagaDiscovered))
            .unwrap();
        let second = instance
            .add_transaction(draft(TransactionPayload::PlayerEntered))
            .unwrap();

        assert_eq!(first, SequenceNumber::new(1));
        assert_eq!(second, SequenceNumber::new(2));
        assert!(
            instance
                .transactions()
                .iter()
                .all(|tx| tx.status() == TransactionStatus::Pending)
        );
        assert_eq!(instance.committed_transactions().count(), 0);
    }

    #[test]
    fn duplicate_transaction_id_is_rejected() {
        let mut instance = instance();
        let draft = draft(TransactionPayload::SagaDiscovered);
        instance.add_transaction(draft.clone()).unwrap();

        let result = instance.add_transaction(draft);
        assert!(matches!(result, Err(SagaLogError::DuplicateTransaction { .. })));
        assert_eq!(instance.transactions().len(), 1);
        assert_eq!(instance.next_sequence_number(), SequenceNumber::new(2));
    }

    #[test]
    fn batch_with_duplicate_appends_nothing() {
        let mut instance = instance();
        let draft = draft(TransactionPayload::SagaDiscovered);

        let result = instance.add_transactions(vec![draft.clone(), draft]);
        assert!(matches!(result, Err(SagaLogError::DuplicateTransaction { .. })));
        assert!(instance.transactions().is_empty());
    }

    #[test]
    fn committed_filter_excludes_pending_and_rolled_back() {
        let mut instance = instance();
        let a = append(&mut instance, TransactionPayload::SagaDiscovered);
        let b = append(&mut instance, TransactionPayload::PlayerEntered);
        let _c = append(&mut instance, TransactionPayload::SagaCompleted);

        assert!(instance.commit(&[a], &CommitOptions::new()).unwrap());
        instance.rollback(&[b]).unwrap();

        let committed: Vec<_> = instance
            .committed_transactions()
            .map(|tx| tx.kind())
            .collect();
        assert_eq!(committed, vec![TransactionKind::SagaDiscovered]);
        assert_eq!(instance.pending_transactions().count(), 1);
    }

    #[test]
    fn sequence_numbers_not_reused_after_rollback() {
        let mut instance = instance();
        let a = append(&mut instance, TransactionPayload::SagaDiscovered);
        instance.rollback(&[a]).unwrap();

        let next = instance
            .add_transaction(draft(TransactionPayload::SagaDiscovered))
            .unwrap();
        assert_eq!(next, SequenceNumber::new(2));
    }

    #[test]
    fn commit_bumps_version_once_per_batch() {
        let mut instance = instance();
        let a = append(&mut instance, TransactionPayload::SagaDiscovered);
        let b = append(&mut instance, TransactionPayload::PlayerEntered);

        assert!(instance.commit(&[a, b], &CommitOptions::new()).unwrap());

        assert_eq!(instance.commit_version(), CommitVersion::new(1));
        assert!(
            instance
                .transactions()
                .iter()
                .all(|tx| tx.committed_in() == Some(CommitVersion::new(1)))
        );
    }

    #[test]
    fn recommitting_is_a_no_op() {
        let mut instance = instance();
        let a = append(&mut instance, TransactionPayload::SagaDiscovered);

        assert!(instance.commit(&[a], &CommitOptions::new()).unwrap());
        assert!(instance.commit(&[a], &CommitOptions::new()).unwrap());

        assert_eq!(instance.commit_version(), CommitVersion::new(1));
        assert_eq!(instance.committed_transactions().count(), 1);
    }

    #[test]
    fn intervening_commit_is_a_conflict_by_default() {
        let mut instance = instance();
        let read_version = instance.commit_version();

        let theirs = append(&mut instance, TransactionPayload::PlayerEntered);
        let ours = append(&mut instance, TransactionPayload::SagaDiscovered);
        assert!(instance.commit(&[theirs], &CommitOptions::new()).unwrap());

        let committed = instance
            .commit(&[ours], &CommitOptions::expect_commit_version(read_version))
            .unwrap();

        assert!(!committed);
        assert_eq!(
            instance.transaction(ours).unwrap().status(),
            TransactionStatus::Pending
        );
    }

    #[test]
    fn conflict_rule_can_let_unrelated_commits_through() {
        let mut instance = instance();
        let read_version = instance.commit_version();

        let theirs = append(&mut instance, TransactionPayload::trigger_activated("approach"));
        let ours = append(&mut instance, TransactionPayload::trigger_activated("approach"));
        assert!(instance.commit(&[theirs], &CommitOptions::new()).unwrap());

        let never = |_: &SagaTransaction, _: &[&SagaTransaction]| false;
        let options = CommitOptions::expect_commit_version(read_version).with_conflict_rule(never);

        assert!(instance.commit(&[ours], &options).unwrap());
        assert_eq!(instance.committed_transactions().count(), 2);
    }

    #[test]
    fn commits_before_read_version_do_not_conflict() {
        let mut instance = instance();
        let earlier = append(&mut instance, TransactionPayload::PlayerEntered);
        assert!(instance.commit(&[earlier], &CommitOptions::new()).unwrap());

        let read_version = instance.commit_version();
        let ours = append(&mut instance, TransactionPayload::SagaDiscovered);

        assert!(
            instance
                .commit(&[ours], &CommitOptions::expect_commit_version(read_version))
                .unwrap()
        );
    }

    #[test]
    fn committing_rolled_back_transaction_fails() {
        let mut instance = instance();
        let a = append(&mut instance, TransactionPayload::SagaDiscovered);
        instance.rollback(&[a]).unwrap();

        let result = instance.commit(&[a], &CommitOptions::new());
        assert!(matches!(
            result,
            Err(SagaLogError::InvalidStatusTransition {
                from: TransactionStatus::RolledBack,
                ..
            })
        ));
    }

    #[test]
    fn rolling_back_committed_transaction_fails_without_partial_effect() {
        let mut instance = instance();
        let pending = append(&mut instance, TransactionPayload::PlayerEntered);
        let committed = append(&mut instance, TransactionPayload::SagaDiscovered);
        instance.commit(&[committed], &CommitOptions::new()).unwrap();

        let result = instance.rollback(&[pending, committed]);
        assert!(matches!(result, Err(SagaLogError::InvalidStatusTransition { .. })));
        assert_eq!(
            instance.transaction(pending).unwrap().status(),
            TransactionStatus::Pending
        );
    }

    #[test]
    fn unknown_transaction_id_fails() {
        let mut instance = instance();
        let result = instance.commit(&[TransactionId::new()], &CommitOptions::new());
        assert!(matches!(result, Err(SagaLogError::TransactionNotFound { .. })));
    }

    #[test]
    fn transactions_after_sequence() {
        let mut instance = instance();
        append(&mut instance, TransactionPayload::SagaDiscovered);
        append(&mut instance, TransactionPayload::PlayerEntered);
        append(&mut instance, TransactionPayload::SagaCompleted);

        let after = instance.transactions_after(SequenceNumber::new(1));
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].sequence_number(), SequenceNumber::new(2));
        assert!(instance.transactions_after(SequenceNumber::new(3)).is_empty());
    }

    #[test]
    fn single_player_instance_involves_only_its_owner() {
        let owner = AvatarId::new();
        let other = AvatarId::new();
        let instance = SagaInstance::single_player(owner, SagaRef::new("crypt"));

        assert!(instance.involves_avatar(owner));
        assert!(!instance.involves_avatar(other));
    }

    #[test]
    fn shared_instance_involves_authors_of_committed_transactions() {
        let visitor = AvatarId::new();
        let mut instance = instance();
        assert!(!instance.involves_avatar(visitor));

        let draft = draft(TransactionPayload::PlayerEntered).avatar(visitor);
        let entered = draft.transaction_id;
        instance.add_transaction(draft).unwrap();
        assert!(!instance.involves_avatar(visitor));

        instance.commit(&[entered], &CommitOptions::new()).unwrap();
        assert!(instance.involves_avatar(visitor));
    }

    #[test]
    fn rolled_back_authorship_does_not_involve_avatar() {
        let visitor = AvatarId::new();
        let mut instance = instance();

        let draft = draft(TransactionPayload::PlayerEntered).avatar(visitor);
        let entered = draft.transaction_id;
        instance.add_transaction(draft).unwrap();
        instance.rollback(&[entered]).unwrap();

        assert!(!instance.involves_avatar(visitor));
    }
}
