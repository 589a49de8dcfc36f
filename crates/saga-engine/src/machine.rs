//! Deterministic replay of a saga instance log.

use chrono::{DateTime, Utc};
use common::{AvatarId, TriggerRef};
use saga_log::{
    SagaInstance, SagaTransaction, SequenceNumber, TransactionDraft, TransactionId,
    TransactionPayload, TransactionStatus,
};

use crate::error::ReplayError;
use crate::state::{CharacterState, SagaState, SagaStatus, TriggerState, TriggerStatus};
use crate::template::SagaTemplate;

/// Context of the transaction being folded.
struct Fold {
    transaction_id: TransactionId,
    avatar_id: Option<AvatarId>,
    at: DateTime<Utc>,
}

/// Pure state machine deriving [`SagaState`] from committed transactions.
///
/// Replay only reads its inputs: it performs no I/O and calling it any
/// number of times on the same instance yields equal states. Pending and
/// rolled-back transactions never contribute.
#[derive(Debug, Clone, Copy)]
pub struct SagaStateMachine<'a> {
    template: &'a SagaTemplate,
}

impl<'a> SagaStateMachine<'a> {
    /// Creates a state machine for instances of the given template.
    pub fn new(template: &'a SagaTemplate) -> Self {
        Self { template }
    }

    /// Returns the template this machine replays against.
    pub fn template(&self) -> &SagaTemplate {
        self.template
    }

    /// Replays every committed transaction.
    pub fn replay_to_now(&self, instance: &SagaInstance) -> Result<SagaState, ReplayError> {
        self.replay(instance, |_| true)
    }

    /// Replays committed transactions accepted at or before `cutoff`.
    pub fn replay_to_timestamp(
        &self,
        instance: &SagaInstance,
        cutoff: DateTime<Utc>,
    ) -> Result<SagaState, ReplayError> {
        self.replay(instance, |tx| tx.server_timestamp() <= cutoff)
    }

    /// Replays committed transactions up to and including `max_sequence`.
    pub fn replay_to_sequence(
        &self,
        instance: &SagaInstance,
        max_sequence: SequenceNumber,
    ) -> Result<SagaState, ReplayError> {
        self.replay(instance, |tx| tx.sequence_number() <= max_sequence)
    }

    /// Applies drafts on top of a state without touching any log.
    ///
    /// Used to check that a batch would replay cleanly before it is appended.
    pub fn preview(
        &self,
        state: &SagaState,
        drafts: &[TransactionDraft],
    ) -> Result<SagaState, ReplayError> {
        let now = Utc::now();
        let mut next = state.clone();
        for draft in drafts {
            let fold = Fold {
                transaction_id: draft.transaction_id,
                avatar_id: draft.avatar_id,
                at: draft.pinned_server_timestamp().unwrap_or(now),
            };
            self.apply(&mut next, &fold, &draft.payload)?;
            next.transaction_count += 1;
        }
        Ok(next)
    }

    /// Replays the log as if the named pending transactions were committed.
    ///
    /// Used to check that committing a batch keeps the log replayable.
    /// Ids that are not pending are ignored.
    pub fn preview_commit(
        &self,
        instance: &SagaInstance,
        transaction_ids: &[TransactionId],
    ) -> Result<SagaState, ReplayError> {
        self.fold_log(instance, |tx| {
            tx.is_committed()
                || (tx.status() == TransactionStatus::Pending
                    && transaction_ids.contains(&tx.transaction_id()))
        })
    }

    fn replay(
        &self,
        instance: &SagaInstance,
        include: impl Fn(&SagaTransaction) -> bool,
    ) -> Result<SagaState, ReplayError> {
        self.fold_log(instance, |tx| tx.is_committed() && include(tx))
    }

    fn fold_log(
        &self,
        instance: &SagaInstance,
        visible: impl Fn(&SagaTransaction) -> bool,
    ) -> Result<SagaState, ReplayError> {
        if instance.saga_ref() != &self.template.saga_ref {
            return Err(ReplayError::TemplateMismatch {
                expected: self.template.saga_ref.clone(),
                actual: instance.saga_ref().clone(),
            });
        }

        let mut state = self.initial_state(instance);
        for tx in instance.transactions().iter().filter(|tx| visible(tx)) {
            let fold = Fold {
                transaction_id: tx.transaction_id(),
                avatar_id: tx.avatar_id(),
                at: tx.server_timestamp(),
            };
            self.apply(&mut state, &fold, tx.payload())?;
            state.transaction_count += 1;
            state.last_sequence_number = Some(tx.sequence_number());
        }

        metrics::counter!("saga_replays_total").increment(1);
        metrics::histogram!("saga_replay_transactions").record(state.transaction_count as f64);
        Ok(state)
    }

    fn initial_state(&self, instance: &SagaInstance) -> SagaState {
        let mut state = SagaState::initial(instance.instance_id(), instance.saga_ref().clone());
        for trigger_ref in &self.template.triggers {
            state
                .triggers
                .insert(trigger_ref.clone(), TriggerState::default());
        }
        state
    }

    fn declared_trigger<'s>(
        &self,
        state: &'s mut SagaState,
        fold: &Fold,
        trigger_ref: &TriggerRef,
    ) -> Result<&'s mut TriggerState, ReplayError> {
        state
            .triggers
            .get_mut(trigger_ref)
            .ok_or_else(|| ReplayError::UnknownTrigger {
                transaction_id: fold.transaction_id,
                trigger_ref: trigger_ref.clone(),
            })
    }

    fn apply(
        &self,
        state: &mut SagaState,
        fold: &Fold,
        payload: &TransactionPayload,
    ) -> Result<(), ReplayError> {
        match payload {
            TransactionPayload::SagaDiscovered => {
                if state.status == SagaStatus::Undiscovered {
                    state.status = SagaStatus::Active;
                }
                state.first_discovered_at.get_or_insert(fold.at);
                if let Some(avatar_id) = fold.avatar_id {
                    state.discovered_by_avatars.insert(avatar_id);
                }
            }
            TransactionPayload::SagaCompleted => {
                state.status = SagaStatus::Completed;
                state.completed_at.get_or_insert(fold.at);
                if let Some(avatar_id) = fold.avatar_id {
                    state.completed_by_avatars.insert(avatar_id);
                }
            }
            TransactionPayload::TriggerActivated(data) => {
                let trigger = self.declared_trigger(state, fold, &data.trigger_ref)?;
                trigger.status = TriggerStatus::Active;
                trigger.activation_count += 1;
                trigger.first_activated_at.get_or_insert(fold.at);
                trigger.last_activated_at = Some(fold.at);
                if let Some(avatar_id) = fold.avatar_id {
                    trigger.triggered_by_avatars.insert(avatar_id);
                }
            }
            TransactionPayload::TriggerCompleted(data) => {
                let trigger = self.declared_trigger(state, fold, &data.trigger_ref)?;
                trigger.status = TriggerStatus::Completed;
                trigger.completed_at = Some(fold.at);
            }
            TransactionPayload::CharacterSpawned(data) => {
                if let Some(trigger_ref) = &data.spawned_by_trigger_ref {
                    self.declared_trigger(state, fold, trigger_ref)?;
                }
                if state.characters.contains_key(&data.character_instance_id) {
                    return Err(ReplayError::DuplicateCharacter {
                        transaction_id: fold.transaction_id,
                        character_instance_id: data.character_instance_id,
                    });
                }
                state.characters.insert(
                    data.character_instance_id,
                    CharacterState::spawned(
                        data.character_ref.clone(),
                        data.spawned_by_trigger_ref.clone(),
                        fold.at,
                    ),
                );
            }
            TransactionPayload::CharacterDamaged(data) => {
                let character = spawned_character(state, fold, data.character_instance_id)?;
                character.current_health -= data.damage_fraction;
                if let Some(avatar_id) = fold.avatar_id {
                    *character.damage_by_avatar.entry(avatar_id).or_insert(0.0) +=
                        data.damage_fraction;
                }
            }
            TransactionPayload::CharacterHealed(data) => {
                let character = spawned_character(state, fold, data.character_instance_id)?;
                character.current_health += data.healing_fraction;
            }
            TransactionPayload::CharacterDefeated(data) => {
                let character = spawned_character(state, fold, data.character_instance_id)?;
                character.is_alive = false;
                character.current_health = 0.0;
                character.defeated_at = Some(fold.at);
            }
            // Logged for other read models; no world-state effect.
            TransactionPayload::PlayerEntered
            | TransactionPayload::PlayerExited
            | TransactionPayload::DialogueChoiceMade(_)
            | TransactionPayload::QuestAccepted(_)
            | TransactionPayload::QuestCompleted(_)
            | TransactionPayload::LootAwarded(_)
            | TransactionPayload::ItemTraded(_)
            | TransactionPayload::ItemCrafted(_)
            | TransactionPayload::MovementClaimed(_)
            | TransactionPayload::ResourceMinedClaimed(_)
            | TransactionPayload::ToolWearClaimed(_) => {}
        }
        Ok(())
    }
}

fn spawned_character<'s>(
    state: &'s mut SagaState,
    fold: &Fold,
    id: common::CharacterInstanceId,
) -> Result<&'s mut CharacterState, ReplayError> {
    state
        .characters
        .get_mut(&id)
        .ok_or(ReplayError::UnknownCharacter {
            transaction_id: fold.transaction_id,
            character_instance_id: id,
        })
}
