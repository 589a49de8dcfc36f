use thiserror::Error;

use crate::{InstanceId, TransactionId, TransactionStatus};

/// Errors that can occur when interacting with the saga transaction log.
///
/// A lost commit race is deliberately not represented here: it is an
/// expected outcome and is reported as `Ok(false)` from a commit.
#[derive(Debug, Error)]
pub enum SagaLogError {
    /// The saga instance does not exist.
    #[error("Saga instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// A transaction id named in a commit or rollback is not in the instance log.
    #[error("Transaction {transaction_id} not found in instance {instance_id}")]
    TransactionNotFound {
        instance_id: InstanceId,
        transaction_id: TransactionId,
    },

    /// A transaction with this id has already been appended.
    #[error("Transaction {transaction_id} already appended to instance {instance_id}")]
    DuplicateTransaction {
        instance_id: InstanceId,
        transaction_id: TransactionId,
    },

    /// A status change that would unfreeze a settled transaction.
    #[error("Transaction {transaction_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        transaction_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// The log contains a transaction kind this build does not know how to replay.
    #[error("Unknown transaction kind: {0}")]
    UnknownTransactionKind(String),

    /// An append, commit or rollback was called with no transactions.
    #[error("Transaction batch is empty")]
    EmptyBatch,

    /// A sequence number or commit version does not fit the database column.
    #[error("Counter {0} exceeds the storable range")]
    CounterOutOfRange(u64),

    /// A stored row could not be mapped back onto the data model.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga log operations.
pub type Result<T> = std::result::Result<T, SagaLogError>;
