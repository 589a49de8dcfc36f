pub mod error;
pub mod instance;
pub mod memory;
pub mod payload;
pub mod postgres;
pub mod query;
pub mod repository;
pub mod transaction;

pub use common::{AvatarId, CharacterInstanceId, InstanceId, SagaRef};
pub use error::{Result, SagaLogError};
pub use instance::{CommitOptions, ConflictRule, InstanceType, SagaInstance};
pub use memory::InMemorySagaRepository;
pub use payload::{TransactionKind, TransactionPayload};
pub use postgres::PostgresSagaRepository;
pub use query::TransactionQuery;
pub use repository::{
    CommitCheckpoint, LoggedTransaction, SagaRepository, SagaRepositoryExt, TransactionStream,
};
pub use transaction::{
    CommitVersion, SagaTransaction, SequenceNumber, TransactionDraft, TransactionId,
    TransactionStatus,
};
