//! Core projection trait and position tracking.

use async_trait::async_trait;
use saga_log::LoggedTransaction;

use crate::Result;

/// Tracks how many transactions a projection has applied.
///
/// Redelivered transactions are skipped and do not advance the position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionPosition {
    /// Number of distinct transactions applied by this projection.
    pub transactions_applied: u64,
}

impl ProjectionPosition {
    /// Creates a new position at zero.
    pub fn zero() -> Self {
        Self {
            transactions_applied: 0,
        }
    }

    /// Advances the position by one transaction.
    pub fn advance(&self) -> Self {
        Self {
            transactions_applied: self.transactions_applied + 1,
        }
    }
}

impl std::fmt::Display for ProjectionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position({})", self.transactions_applied)
    }
}

/// A projection that folds committed transactions into a read model.
///
/// Delivery is at-least-once: the processor may hand the same transaction
/// over again after a restart or a repeated catch-up, so implementations
/// must ignore transaction ids they have already applied.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Returns the name of this projection.
    fn name(&self) -> &'static str;

    /// Handles a single committed transaction.
    async fn handle(&self, logged: &LoggedTransaction) -> Result<()>;

    /// Returns the current position of this projection.
    async fn position(&self) -> ProjectionPosition;

    /// Resets the projection to its initial state.
    async fn reset(&self) -> Result<()>;
}
