use chrono::{DateTime, Utc};

use crate::{
    AvatarId, InstanceId, SagaInstance, SagaRef, SagaTransaction, SequenceNumber,
    TransactionKind, TransactionStatus,
};

/// Builder for constructing transaction queries.
///
/// Results are always ordered by instance creation then sequence number,
/// never by timestamp.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    /// Filter by instance ID.
    pub instance_id: Option<InstanceId>,

    /// Filter by saga template.
    pub saga_ref: Option<SagaRef>,

    /// Filter by kinds (any of these kinds).
    pub kinds: Option<Vec<TransactionKind>>,

    /// Filter by acting avatar.
    pub avatar_id: Option<AvatarId>,

    /// Filter by status.
    pub status: Option<TransactionStatus>,

    /// Filter by minimum sequence number (inclusive).
    pub from_sequence: Option<SequenceNumber>,

    /// Filter by maximum sequence number (inclusive).
    pub to_sequence: Option<SequenceNumber>,

    /// Filter by server timestamp at or after this time.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by server timestamp at or before this time.
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of transactions to return.
    pub limit: Option<usize>,

    /// Number of transactions to skip.
    pub offset: Option<usize>,
}

impl TransactionQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific instance.
    pub fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Default::default()
        }
    }

    /// Creates a query for transactions of a specific kind.
    pub fn for_kind(kind: TransactionKind) -> Self {
        Self {
            kinds: Some(vec![kind]),
            ..Default::default()
        }
    }

    /// Filters by instance ID.
    pub fn instance_id(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Filters by saga template.
    pub fn saga_ref(mut self, saga_ref: impl Into<SagaRef>) -> Self {
        self.saga_ref = Some(saga_ref.into());
        self
    }

    /// Filters by kind.
    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kinds = Some(vec![kind]);
        self
    }

    /// Filters by multiple kinds (any of these).
    pub fn kinds(mut self, kinds: Vec<TransactionKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filters by acting avatar.
    pub fn avatar_id(mut self, avatar_id: AvatarId) -> Self {
        self.avatar_id = Some(avatar_id);
        self
    }

    /// Filters by status.
    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filters to committed transactions.
    pub fn committed(self) -> Self {
        self.status(TransactionStatus::Committed)
    }

    /// Filters to transactions starting from this sequence number (inclusive).
    pub fn from_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    /// Filters to transactions up to this sequence number (inclusive).
    pub fn to_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    /// Filters to transactions accepted at or after this time.
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to transactions accepted at or before this time.
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of transactions returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many transactions before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if any transaction of the instance could match.
    pub(crate) fn matches_instance(&self, instance: &SagaInstance) -> bool {
        if let Some(id) = self.instance_id
            && instance.instance_id() != id
        {
            return false;
        }
        if let Some(ref saga_ref) = self.saga_ref
            && instance.saga_ref() != saga_ref
        {
            return false;
        }
        true
    }

    /// Returns true if the transaction passes every transaction-level filter.
    pub(crate) fn matches_transaction(&self, tx: &SagaTransaction) -> bool {
        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&tx.kind())
        {
            return false;
        }
        if let Some(avatar_id) = self.avatar_id
            && tx.avatar_id() != Some(avatar_id)
        {
            return false;
        }
        if let Some(status) = self.status
            && tx.status() != status
        {
            return false;
        }
        if let Some(from) = self.from_sequence
            && tx.sequence_number() < from
        {
            return false;
        }
        if let Some(to) = self.to_sequence
            && tx.sequence_number() > to
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && tx.server_timestamp() < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && tx.server_timestamp() > to
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransactionDraft, TransactionPayload};

    #[test]
    fn query_for_instance() {
        let id = InstanceId::new();
        let query = TransactionQuery::for_instance(id);

        assert_eq!(query.instance_id, Some(id));
        assert!(query.kinds.is_none());
    }

    #[test]
    fn query_builder_chain() {
        let id = InstanceId::new();
        let avatar = AvatarId::new();
        let query = TransactionQuery::new()
            .instance_id(id)
            .kind(TransactionKind::CharacterDamaged)
            .avatar_id(avatar)
            .committed()
            .from_sequence(SequenceNumber::new(2))
            .to_sequence(SequenceNumber::new(10))
            .limit(50)
            .offset(5);

        assert_eq!(query.instance_id, Some(id));
        assert_eq!(query.kinds, Some(vec![TransactionKind::CharacterDamaged]));
        assert_eq!(query.avatar_id, Some(avatar));
        assert_eq!(query.status, Some(TransactionStatus::Committed));
        assert_eq!(query.from_sequence, Some(SequenceNumber::new(2)));
        assert_eq!(query.to_sequence, Some(SequenceNumber::new(10)));
        assert_eq!(query.limit, Some(50));
        assert_eq!(query.offset, Some(5));
    }

    #[test]
    fn transaction_filters_apply_together() {
        let avatar = AvatarId::new();
        let mut instance = SagaInstance::shared(SagaRef::new("crypt"));
        instance
            .add_transaction(TransactionDraft::new(TransactionPayload::PlayerEntered).avatar(avatar))
            .unwrap();
        instance
            .add_transaction(TransactionDraft::new(TransactionPayload::SagaDiscovered).avatar(avatar))
            .unwrap();
        instance
            .add_transaction(TransactionDraft::new(TransactionPayload::SagaDiscovered))
            .unwrap();

        let query = TransactionQuery::for_kind(TransactionKind::SagaDiscovered).avatar_id(avatar);
        let matched: Vec<_> = instance
            .transactions()
            .iter()
            .filter(|tx| query.matches_transaction(tx))
            .map(|tx| tx.sequence_number())
            .collect();

        assert_eq!(matched, vec![SequenceNumber::new(2)]);
    }

    #[test]
    fn instance_filter_by_saga_ref() {
        let instance = SagaInstance::shared(SagaRef::new("crypt"));

        assert!(TransactionQuery::new().saga_ref("crypt").matches_instance(&instance));
        assert!(!TransactionQuery::new().saga_ref("tower").matches_instance(&instance));
        assert!(
            !TransactionQuery::for_instance(InstanceId::new()).matches_instance(&instance)
        );
    }
}
