//! Projection processor for feeding the committed log to projections.

use futures_util::StreamExt;
use saga_log::{CommitCheckpoint, LoggedTransaction, SagaRepository};
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::Projection;

/// Reads committed transactions from a saga repository and delivers them to
/// projections.
///
/// The processor supports:
/// - Catch-up: streams the commits made since the last catch-up to every projection
/// - Single delivery: hands one freshly committed transaction to all projections
/// - Rebuild: resets all projections and catches up from scratch
///
/// Catch-up remembers the commit version it reached in each instance and
/// only asks the repository for later commits. Delivery is still
/// at-least-once (concurrent catch-ups may overlap), so projections skip
/// the transaction ids they have already applied.
pub struct ProjectionProcessor<R: SagaRepository> {
    repository: R,
    projections: Vec<Box<dyn Projection>>,
    checkpoint: RwLock<CommitCheckpoint>,
}

impl<R: SagaRepository> ProjectionProcessor<R> {
    /// Creates a new processor reading from the given repository.
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            projections: Vec::new(),
            checkpoint: RwLock::new(CommitCheckpoint::new()),
        }
    }

    /// Registers a projection with this processor.
    pub fn register(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    /// Delivers every transaction committed since the previous catch-up to
    /// every projection. Returns how many transactions were delivered.
    ///
    /// The checkpoint only advances once the whole batch was delivered, so a
    /// failed catch-up is retried in full by the next one.
    #[tracing::instrument(skip(self))]
    pub async fn run_catch_up(&self) -> Result<u64> {
        let since = self.checkpoint.read().await.clone();
        let mut stream = self.repository.stream_committed_since(&since).await?;
        let mut reached = CommitCheckpoint::new();
        let mut delivered: u64 = 0;

        while let Some(result) = stream.next().await {
            let logged = result?;
            self.deliver(&logged).await?;
            if let Some(version) = logged.transaction.committed_in() {
                let mark = reached.entry(logged.instance_id).or_default();
                *mark = (*mark).max(version);
            }
            delivered += 1;
        }

        let mut checkpoint = self.checkpoint.write().await;
        for (instance_id, version) in reached {
            let mark = checkpoint.entry(instance_id).or_default();
            *mark = (*mark).max(version);
        }

        tracing::info!(transactions = delivered, "catch-up complete");
        Ok(delivered)
    }

    /// Delivers a single committed transaction to all registered projections.
    #[tracing::instrument(
        skip(self, logged),
        fields(instance_id = %logged.instance_id, kind = %logged.transaction.kind())
    )]
    pub async fn process(&self, logged: &LoggedTransaction) -> Result<()> {
        if !logged.transaction.is_committed() {
            tracing::debug!("ignoring uncommitted transaction");
            return Ok(());
        }
        self.deliver(logged).await
    }

    /// Resets all projections and rebuilds them from the committed log.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<u64> {
        for projection in &self.projections {
            projection.reset().await?;
        }
        self.checkpoint.write().await.clear();
        self.run_catch_up().await
    }

    async fn deliver(&self, logged: &LoggedTransaction) -> Result<()> {
        for projection in &self.projections {
            projection.handle(logged).await?;
            metrics::counter!("projections_transactions_delivered", "projection" => projection.name())
                .increment(1);
        }
        Ok(())
    }
}
