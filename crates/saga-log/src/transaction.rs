use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AvatarId, TransactionKind, TransactionPayload};

/// Globally unique identifier for a saga transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a new random transaction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a transaction ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Position of a transaction in its instance log.
///
/// Sequence numbers start at 1, are assigned at append time and are never
/// reused, even after a rollback. They are the only ordering key replay uses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Creates a sequence number from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the sequence number assigned to the first transaction of an instance.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Counter of successful commit batches on an instance.
///
/// Starts at 0 and moves forward by one each time a commit flips at least one
/// transaction to `Committed`. Writers record the version they read and hand it
/// back at commit time to detect intervening commits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CommitVersion(u64);

impl CommitVersion {
    /// Creates a commit version from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the version of an instance nothing has been committed to.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CommitVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a transaction.
///
/// ```text
/// Pending ──┬──► Committed
///           └──► RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Appended but not yet visible to replay.
    #[default]
    Pending,

    /// Visible to every replay (terminal).
    Committed,

    /// Permanently excluded from replay, kept for audit (terminal).
    RolledBack,
}

impl TransactionStatus {
    /// Returns true if the status can no longer change.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Committed => "Committed",
            Self::RolledBack => "RolledBack",
        }
    }

    /// Parses a status name produced by [`Self::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Committed" => Some(Self::Committed),
            "RolledBack" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable fact in a saga instance log.
///
/// Fields are read-only from outside this crate. Only the commit and rollback
/// paths of a repository move `status` out of `Pending`, and they do so once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaTransaction {
    transaction_id: TransactionId,
    avatar_id: Option<AvatarId>,
    local_timestamp: Option<DateTime<Utc>>,
    server_timestamp: DateTime<Utc>,
    sequence_number: SequenceNumber,
    status: TransactionStatus,
    committed_in: Option<CommitVersion>,
    payload: TransactionPayload,
}

impl SagaTransaction {
    /// Creates a transaction draft carrying the given payload.
    pub fn draft(payload: TransactionPayload) -> TransactionDraft {
        TransactionDraft::new(payload)
    }

    pub(crate) fn from_draft(
        draft: TransactionDraft,
        sequence_number: SequenceNumber,
        accepted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: draft.transaction_id,
            avatar_id: draft.avatar_id,
            local_timestamp: draft.local_timestamp.map(to_storage_precision),
            server_timestamp: to_storage_precision(draft.server_timestamp.unwrap_or(accepted_at)),
            sequence_number,
            status: TransactionStatus::Pending,
            committed_in: None,
            payload: draft.payload,
        }
    }

    /// Rebuilds a transaction from its stored representation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        transaction_id: TransactionId,
        avatar_id: Option<AvatarId>,
        local_timestamp: Option<DateTime<Utc>>,
        server_timestamp: DateTime<Utc>,
        sequence_number: SequenceNumber,
        status: TransactionStatus,
        committed_in: Option<CommitVersion>,
        payload: TransactionPayload,
    ) -> Self {
        Self {
            transaction_id,
            avatar_id,
            local_timestamp,
            server_timestamp,
            sequence_number,
            status,
            committed_in,
            payload,
        }
    }

    pub(crate) fn mark_committed(&mut self, version: CommitVersion) {
        self.status = TransactionStatus::Committed;
        self.committed_in = Some(version);
    }

    pub(crate) fn mark_rolled_back(&mut self) {
        self.status = TransactionStatus::RolledBack;
    }

    /// Returns the transaction ID.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Returns the event kind.
    pub fn kind(&self) -> TransactionKind {
        self.payload.kind()
    }

    /// Returns the acting avatar, or `None` for world-authored events.
    pub fn avatar_id(&self) -> Option<AvatarId> {
        self.avatar_id
    }

    /// Returns the client-supplied timestamp. Untrusted.
    pub fn local_timestamp(&self) -> Option<DateTime<Utc>> {
        self.local_timestamp
    }

    /// Returns the authoritative time the transaction was accepted.
    pub fn server_timestamp(&self) -> DateTime<Utc> {
        self.server_timestamp
    }

    /// Returns the position in the instance log.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Returns the current status.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Returns the commit version this transaction became visible in.
    pub fn committed_in(&self) -> Option<CommitVersion> {
        self.committed_in
    }

    /// Returns the typed payload.
    pub fn payload(&self) -> &TransactionPayload {
        &self.payload
    }

    /// Returns true if the transaction is visible to replay.
    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }
}

/// Truncates a timestamp to the microsecond precision PostgreSQL keeps, so
/// both logs hand back identical timestamps.
pub(crate) fn to_storage_precision(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(6)
}

/// A transaction that has been decided on but not yet appended.
///
/// The instance assigns the sequence number and the server timestamp at
/// append time.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDraft {
    pub transaction_id: TransactionId,
    pub avatar_id: Option<AvatarId>,
    pub local_timestamp: Option<DateTime<Utc>>,
    pub(crate) server_timestamp: Option<DateTime<Utc>>,
    pub payload: TransactionPayload,
}

impl TransactionDraft {
    /// Creates a world-authored draft with a fresh transaction ID.
    pub fn new(payload: TransactionPayload) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            avatar_id: None,
            local_timestamp: None,
            server_timestamp: None,
            payload,
        }
    }

    /// Sets the transaction ID.
    pub fn transaction_id(mut self, id: TransactionId) -> Self {
        self.transaction_id = id;
        self
    }

    /// Sets the acting avatar.
    pub fn avatar(mut self, avatar_id: AvatarId) -> Self {
        self.avatar_id = Some(avatar_id);
        self
    }

    /// Sets the client-supplied timestamp.
    pub fn local_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.local_timestamp = Some(timestamp);
        self
    }

    /// Returns the pinned server timestamp, if any.
    pub fn pinned_server_timestamp(&self) -> Option<DateTime<Utc>> {
        self.server_timestamp
    }

    /// Pins the server timestamp instead of taking the time of append.
    ///
    /// Only available to tests, so histories with known times can be built.
    #[cfg(any(test, feature = "test-util"))]
    pub fn server_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(timestamp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_start_at_one() {
        assert_eq!(SequenceNumber::first().as_u64(), 1);
        assert_eq!(SequenceNumber::default().next(), SequenceNumber::first());
    }

    #[test]
    fn commit_version_ordering() {
        let v0 = CommitVersion::initial();
        assert!(v0 < v0.next());
        assert_eq!(v0.next().as_u64(), 1);
    }

    #[test]
    fn status_names_parse_back() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Committed,
            TransactionStatus::RolledBack,
        ] {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransactionStatus::parse("Lost"), None);
    }

    #[test]
    fn only_terminal_statuses_are_settled() {
        assert!(!TransactionStatus::Pending.is_settled());
        assert!(TransactionStatus::Committed.is_settled());
        assert!(TransactionStatus::RolledBack.is_settled());
    }

    #[test]
    fn draft_without_server_timestamp_takes_accept_time() {
        let accepted_at = Utc::now();
        let avatar = AvatarId::new();
        let draft = SagaTransaction::draft(TransactionPayload::SagaDiscovered).avatar(avatar);

        let tx = SagaTransaction::from_draft(draft, SequenceNumber::first(), accepted_at);

        assert_eq!(tx.server_timestamp(), accepted_at.trunc_subsecs(6));
        assert_eq!(tx.avatar_id(), Some(avatar));
        assert_eq!(tx.status(), TransactionStatus::Pending);
        assert_eq!(tx.kind(), TransactionKind::SagaDiscovered);
        assert!(tx.committed_in().is_none());
    }

    #[test]
    fn pinned_server_timestamp_is_kept() {
        let pinned = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let draft = TransactionDraft::new(TransactionPayload::PlayerEntered).server_timestamp(pinned);

        let tx = SagaTransaction::from_draft(draft, SequenceNumber::new(4), Utc::now());

        assert_eq!(tx.server_timestamp(), pinned);
        assert_eq!(tx.sequence_number(), SequenceNumber::new(4));
    }

    #[test]
    fn timestamps_are_kept_at_microsecond_precision() {
        let accepted_at = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let local = DateTime::from_timestamp(1_699_999_999, 987_654_321).unwrap();
        let draft = TransactionDraft::new(TransactionPayload::PlayerEntered).local_timestamp(local);

        let tx = SagaTransaction::from_draft(draft, SequenceNumber::first(), accepted_at);

        assert_eq!(tx.server_timestamp().timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(
            tx.local_timestamp().map(|t| t.timestamp_subsec_nanos()),
            Some(987_654_000)
        );
    }
}
