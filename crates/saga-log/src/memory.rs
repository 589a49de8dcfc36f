use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AvatarId, CommitOptions, InstanceId, Result, SagaInstance, SagaLogError, SagaRef,
    SagaTransaction, SequenceNumber, TransactionDraft, TransactionId, TransactionQuery,
    repository::{
        CommitCheckpoint, LoggedTransaction, SagaRepository, TransactionStream, record_commit,
    },
};

#[derive(Default)]
struct State {
    instances: HashMap<InstanceId, SagaInstance>,
    single_player: HashMap<(AvatarId, SagaRef), InstanceId>,
    shared: HashMap<SagaRef, InstanceId>,
    creation_order: Vec<InstanceId>,
}

impl State {
    fn insert(&mut self, instance: SagaInstance) -> SagaInstance {
        let instance_id = instance.instance_id();
        self.creation_order.push(instance_id);
        self.instances.insert(instance_id, instance.clone());
        instance
    }

    fn instance_mut(&mut self, instance_id: InstanceId) -> Result<&mut SagaInstance> {
        self.instances
            .get_mut(&instance_id)
            .ok_or(SagaLogError::InstanceNotFound(instance_id))
    }

    fn instance(&self, instance_id: InstanceId) -> Result<&SagaInstance> {
        self.instances
            .get(&instance_id)
            .ok_or(SagaLogError::InstanceNotFound(instance_id))
    }

    fn in_creation_order(&self) -> impl Iterator<Item = &SagaInstance> {
        self.creation_order
            .iter()
            .filter_map(|id| self.instances.get(id))
    }
}

/// In-memory saga repository.
///
/// Used by tests and as the default API backend. Every mutation runs under
/// the write lock, so sequence assignment and commits are atomic.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    state: Arc<RwLock<State>>,
}

impl InMemorySagaRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of instances stored.
    pub async fn instance_count(&self) -> usize {
        self.state.read().await.instances.len()
    }

    /// Removes every instance.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = State::default();
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn get_or_create_instance(
        &self,
        avatar_id: AvatarId,
        saga_ref: &SagaRef,
    ) -> Result<SagaInstance> {
        let mut state = self.state.write().await;
        let key = (avatar_id, saga_ref.clone());
        if let Some(&instance_id) = state.single_player.get(&key) {
            return state.instance(instance_id).cloned();
        }

        let instance = SagaInstance::single_player(avatar_id, saga_ref.clone());
        state.single_player.insert(key, instance.instance_id());
        tracing::debug!(instance_id = %instance.instance_id(), %avatar_id, %saga_ref, "created single-player instance");
        Ok(state.insert(instance))
    }

    async fn get_or_create_shared_instance(&self, saga_ref: &SagaRef) -> Result<SagaInstance> {
        let mut state = self.state.write().await;
        if let Some(&instance_id) = state.shared.get(saga_ref) {
            return state.instance(instance_id).cloned();
        }

        let instance = SagaInstance::shared(saga_ref.clone());
        state.shared.insert(saga_ref.clone(), instance.instance_id());
        tracing::debug!(instance_id = %instance.instance_id(), %saga_ref, "created shared instance");
        Ok(state.insert(instance))
    }

    async fn get_instance_by_id(&self, instance_id: InstanceId) -> Result<Option<SagaInstance>> {
        let state = self.state.read().await;
        Ok(state.instances.get(&instance_id).cloned())
    }

    async fn add_transactions(
        &self,
        instance_id: InstanceId,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<SequenceNumber>> {
        let mut state = self.state.write().await;
        state.instance_mut(instance_id)?.add_transactions(drafts)
    }

    async fn get_transactions(&self, instance_id: InstanceId) -> Result<Vec<SagaTransaction>> {
        let state = self.state.read().await;
        Ok(state.instance(instance_id)?.transactions().to_vec())
    }

    async fn get_transactions_after_sequence(
        &self,
        instance_id: InstanceId,
        sequence: SequenceNumber,
    ) -> Result<Vec<SagaTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .instance(instance_id)?
            .transactions_after(sequence)
            .to_vec())
    }

    async fn commit_transactions(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
        options: CommitOptions,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let committed = state
            .instance_mut(instance_id)?
            .commit(transaction_ids, &options)?;
        record_commit(instance_id, committed);
        Ok(committed)
    }

    async fn rollback_transactions(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.instance_mut(instance_id)?.rollback(transaction_ids)
    }

    async fn get_all_instances_for_avatar(&self, avatar_id: AvatarId) -> Result<Vec<SagaInstance>> {
        let state = self.state.read().await;
        Ok(state
            .in_creation_order()
            .filter(|instance| instance.involves_avatar(avatar_id))
            .cloned()
            .collect())
    }

    async fn query_transactions(&self, query: TransactionQuery) -> Result<Vec<LoggedTransaction>> {
        let state = self.state.read().await;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        let results = state
            .in_creation_order()
            .filter(|instance| query.matches_instance(instance))
            .flat_map(|instance| {
                instance
                    .transactions()
                    .iter()
                    .filter(|tx| query.matches_transaction(tx))
                    .map(move |tx| LoggedTransaction {
                        instance_id: instance.instance_id(),
                        saga_ref: instance.saga_ref().clone(),
                        transaction: tx.clone(),
                    })
            })
            .skip(offset)
            .take(limit)
            .collect();

        Ok(results)
    }

    async fn stream_committed_transactions(&self) -> Result<TransactionStream> {
        use futures_util::stream;

        let state = self.state.read().await;
        let committed: Vec<_> = state
            .in_creation_order()
            .flat_map(|instance| {
                instance
                    .committed_transactions()
                    .map(move |tx| LoggedTransaction {
                        instance_id: instance.instance_id(),
                        saga_ref: instance.saga_ref().clone(),
                        transaction: tx.clone(),
                    })
            })
            .collect();

        let stream = stream::iter(committed.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn stream_committed_since(
        &self,
        checkpoint: &CommitCheckpoint,
    ) -> Result<TransactionStream> {
        use futures_util::stream;

        let state = self.state.read().await;
        let fresh: Vec<_> = state
            .in_creation_order()
            .filter_map(|instance| {
                let seen = checkpoint
                    .get(&instance.instance_id())
                    .copied()
                    .unwrap_or_default();
                (instance.commit_version() > seen).then_some((instance, seen))
            })
            .flat_map(|(instance, seen)| {
                instance
                    .committed_transactions()
                    .filter(move |tx| tx.committed_in().is_some_and(|version| version > seen))
                    .map(move |tx| LoggedTransaction {
                        instance_id: instance.instance_id(),
                        saga_ref: instance.saga_ref().clone(),
                        transaction: tx.clone(),
                    })
            })
            .collect();

        let stream = stream::iter(fresh.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }
}
