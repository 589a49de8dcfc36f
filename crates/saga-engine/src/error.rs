//! Engine error types.

use common::{CharacterInstanceId, InstanceId, SagaRef, TriggerRef};
use saga_log::{SagaLogError, TransactionId};
use thiserror::Error;

/// Integrity failures found while folding a transaction log.
///
/// The log is authoritative, so a transaction referring to something that
/// does not exist means an upstream producer wrote bad data. Replay stops
/// instead of inventing the missing entity.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    /// The instance was created from a different saga template.
    #[error("Instance belongs to saga {actual}, not {expected}")]
    TemplateMismatch { expected: SagaRef, actual: SagaRef },

    /// A transaction names a trigger the template does not declare.
    #[error("Transaction {transaction_id} references undeclared trigger {trigger_ref}")]
    UnknownTrigger {
        transaction_id: TransactionId,
        trigger_ref: TriggerRef,
    },

    /// A transaction targets a character that was never spawned.
    #[error("Transaction {transaction_id} references unspawned character {character_instance_id}")]
    UnknownCharacter {
        transaction_id: TransactionId,
        character_instance_id: CharacterInstanceId,
    },

    /// A character id was spawned twice.
    #[error("Transaction {transaction_id} spawns character {character_instance_id} again")]
    DuplicateCharacter {
        transaction_id: TransactionId,
        character_instance_id: CharacterInstanceId,
    },
}

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Lost every commit race it was allowed to retry.
    Conflict,

    /// The current state does not allow the command.
    Validation,
}

impl FailureKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Conflict => "Conflict",
            FailureKind::Validation => "Validation",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured command failure reported back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub instance_id: InstanceId,
    pub kind: FailureKind,
    pub reason: String,
}

impl CommandFailure {
    /// Creates a validation failure.
    pub fn validation(instance_id: InstanceId, reason: impl Into<String>) -> Self {
        Self {
            instance_id,
            kind: FailureKind::Validation,
            reason: reason.into(),
        }
    }

    /// Creates a conflict failure.
    pub fn conflict(instance_id: InstanceId, reason: impl Into<String>) -> Self {
        Self {
            instance_id,
            kind: FailureKind::Conflict,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failure on instance {}: {}",
            self.kind, self.instance_id, self.reason
        )
    }
}

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error occurred in the transaction log.
    #[error("Saga log error: {0}")]
    Log(#[from] SagaLogError),

    /// The committed log could not be replayed.
    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    /// No template is registered for the saga.
    #[error("Saga template not found: {0}")]
    TemplateNotFound(SagaRef),

    /// The command was refused.
    #[error("{0}")]
    CommandFailed(CommandFailure),

    /// The task settling a batch panicked or was cancelled.
    #[error("Commit task failed: {0}")]
    CommitTask(#[from] tokio::task::JoinError),

    /// A template catalog could not be built.
    #[error("Invalid template catalog: {0}")]
    InvalidCatalog(String),

    /// A template catalog file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns the command failure, if this error is one.
    pub fn as_command_failure(&self) -> Option<&CommandFailure> {
        match self {
            EngineError::CommandFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<CommandFailure> for EngineError {
    fn from(failure: CommandFailure) -> Self {
        EngineError::CommandFailed(failure)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
