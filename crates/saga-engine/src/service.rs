//! Saga service providing a simplified API for saga operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{AvatarId, CharacterInstanceId, InstanceId, SagaRef, TriggerRef};
use saga_log::{
    CommitOptions, CommitVersion, ConflictRule, SagaInstance, SagaRepository, SagaRepositoryExt,
    SagaTransaction, SequenceNumber, TransactionDraft, TransactionId, TransactionKind,
    TransactionPayload,
};

use crate::command::{CommandOutcome, Rejection, SagaCommandHandler};
use crate::commands::{
    ActivateTrigger, CompleteSaga, CompleteTrigger, DamageCharacter, DiscoverSaga,
    HealCharacter, Presence, RecordPresence, RecordTransaction, SpawnCharacter,
};
use crate::error::{CommandFailure, Result};
use crate::state::{CharacterState, SagaState};
use crate::template::TemplateCatalog;

/// Service for managing saga instances.
///
/// Wraps the command handler with one method per intent. Each intent picks
/// the narrowest conflict rule that keeps it correct, so unrelated activity
/// in a shared instance does not force a retry.
pub struct SagaService<R: SagaRepository> {
    handler: SagaCommandHandler<R>,
}

impl<R: SagaRepository + Clone + 'static> SagaService<R> {
    /// Creates a new saga service.
    pub fn new(repository: R, catalog: Arc<TemplateCatalog>) -> Self {
        Self {
            handler: SagaCommandHandler::new(repository, catalog),
        }
    }

    /// Wraps an already configured command handler.
    pub fn from_handler(handler: SagaCommandHandler<R>) -> Self {
        Self { handler }
    }

    /// Returns a reference to the underlying command handler.
    pub fn handler(&self) -> &SagaCommandHandler<R> {
        &self.handler
    }

    /// Returns a reference to the underlying repository.
    pub fn repository(&self) -> &R {
        self.handler.repository()
    }

    /// Opens the avatar's single-player instance of a saga, creating it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn open_instance(&self, avatar_id: AvatarId, saga_ref: SagaRef) -> Result<SagaInstance> {
        self.handler.catalog().require(&saga_ref)?;
        let instance = self
            .repository()
            .get_or_create_instance(avatar_id, &saga_ref)
            .await?;
        tracing::debug!(instance_id = %instance.instance_id(), "opened single-player instance");
        Ok(instance)
    }

    /// Opens the shared instance of a saga, creating it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn open_shared_instance(&self, saga_ref: SagaRef) -> Result<SagaInstance> {
        self.handler.catalog().require(&saga_ref)?;
        let instance = self
            .repository()
            .get_or_create_shared_instance(&saga_ref)
            .await?;
        tracing::debug!(instance_id = %instance.instance_id(), "opened shared instance");
        Ok(instance)
    }

    /// Returns the state derived from every committed transaction.
    #[tracing::instrument(skip(self))]
    pub async fn current_state(&self, instance_id: InstanceId) -> Result<SagaState> {
        let (_, state) = self.handler.load(instance_id).await?;
        Ok(state)
    }

    /// Returns the state as of a sequence number, inclusive.
    #[tracing::instrument(skip(self))]
    pub async fn state_at_sequence(
        &self,
        instance_id: InstanceId,
        sequence: SequenceNumber,
    ) -> Result<SagaState> {
        let instance = self.load_instance(instance_id).await?;
        let state = self
            .handler
            .machine_for(&instance)?
            .replay_to_sequence(&instance, sequence)?;
        Ok(state)
    }

    /// Returns the state as of a server time, inclusive.
    #[tracing::instrument(skip(self))]
    pub async fn state_at_time(
        &self,
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    ) -> Result<SagaState> {
        let instance = self.load_instance(instance_id).await?;
        let state = self
            .handler
            .machine_for(&instance)?
            .replay_to_timestamp(&instance, timestamp)?;
        Ok(state)
    }

    /// Records a discovery. Discovering twice is a no-op for that avatar.
    #[tracing::instrument(skip(self))]
    pub async fn discover_saga(&self, cmd: DiscoverSaga) -> Result<CommandOutcome> {
        let avatar_id = cmd.avatar_id;

        self.handler
            .execute_with_rule(cmd.instance_id, Some(Arc::new(NoConflicts)), |state| {
                if state.discovered_by_avatars.contains(&avatar_id) {
                    return Ok(vec![]);
                }
                Ok(vec![
                    TransactionDraft::new(TransactionPayload::SagaDiscovered).avatar(avatar_id),
                ])
            })
            .await
    }

    /// Records a completion. The saga must have been discovered.
    #[tracing::instrument(skip(self))]
    pub async fn complete_saga(&self, cmd: CompleteSaga) -> Result<CommandOutcome> {
        let avatar_id = cmd.avatar_id;

        self.handler
            .execute(cmd.instance_id, |state| {
                if !state.status.is_discovered() {
                    return Err(Rejection::new("saga has not been discovered"));
                }
                if state.completed_by_avatars.contains(&avatar_id) {
                    return Ok(vec![]);
                }
                Ok(vec![
                    TransactionDraft::new(TransactionPayload::SagaCompleted).avatar(avatar_id),
                ])
            })
            .await
    }

    /// Activates a trigger. Only a concurrent completion of the same trigger conflicts.
    #[tracing::instrument(skip(self))]
    pub async fn activate_trigger(&self, cmd: ActivateTrigger) -> Result<CommandOutcome> {
        let trigger_ref = cmd.trigger_ref.clone();
        let avatar_id = cmd.avatar_id;
        let rule = TriggerCompletion(cmd.trigger_ref);

        self.handler
            .execute_with_rule(cmd.instance_id, Some(Arc::new(rule)), |state| {
                let trigger = state.trigger(&trigger_ref).ok_or_else(|| {
                    Rejection::new(format!("trigger {trigger_ref} is not declared by this saga"))
                })?;
                if !trigger.status.can_activate() {
                    return Err(Rejection::new(format!(
                        "trigger {trigger_ref} is already {}",
                        trigger.status
                    )));
                }
                Ok(vec![authored(
                    TransactionPayload::trigger_activated(trigger_ref.clone()),
                    avatar_id,
                )])
            })
            .await
    }

    /// Completes an active trigger.
    #[tracing::instrument(skip(self))]
    pub async fn complete_trigger(&self, cmd: CompleteTrigger) -> Result<CommandOutcome> {
        let trigger_ref = cmd.trigger_ref.clone();
        let avatar_id = cmd.avatar_id;

        self.handler
            .execute(cmd.instance_id, |state| {
                let trigger = state.trigger(&trigger_ref).ok_or_else(|| {
                    Rejection::new(format!("trigger {trigger_ref} is not declared by this saga"))
                })?;
                if !trigger.status.can_complete() {
                    return Err(Rejection::new(format!(
                        "trigger {trigger_ref} is {}, not Active",
                        trigger.status
                    )));
                }
                Ok(vec![authored(
                    TransactionPayload::trigger_completed(trigger_ref.clone()),
                    avatar_id,
                )])
            })
            .await
    }

    /// Spawns a character. Only a concurrent spawn of the same id conflicts.
    #[tracing::instrument(skip(self))]
    pub async fn spawn_character(&self, cmd: SpawnCharacter) -> Result<CommandOutcome> {
        let SpawnCharacter {
            instance_id,
            character_instance_id,
            character_ref,
            spawned_by_trigger_ref,
        } = cmd;
        let rule = CharacterSpawn(character_instance_id);

        self.handler
            .execute_with_rule(instance_id, Some(Arc::new(rule)), |state| {
                if state.character(character_instance_id).is_some() {
                    return Err(Rejection::new(format!(
                        "character {character_instance_id} has already been spawned"
                    )));
                }
                Ok(vec![TransactionDraft::new(TransactionPayload::character_spawned(
                    character_instance_id,
                    character_ref.clone(),
                    spawned_by_trigger_ref.clone(),
                ))])
            })
            .await
    }

    /// Damages a living character, defeating it when its health runs out.
    ///
    /// Any health change to the same character committed in the meantime
    /// invalidates the decision about whether this blow is the killing one.
    #[tracing::instrument(skip(self))]
    pub async fn damage_character(&self, cmd: DamageCharacter) -> Result<CommandOutcome> {
        let DamageCharacter {
            instance_id,
            avatar_id,
            character_instance_id,
            damage_fraction,
        } = cmd;
        let rule = CharacterHealth(character_instance_id);

        self.handler
            .execute_with_rule(instance_id, Some(Arc::new(rule)), |state| {
                check_fraction(damage_fraction)?;
                let character = living_character(state, character_instance_id)?;

                let mut drafts = vec![authored(
                    TransactionPayload::character_damaged(character_instance_id, damage_fraction),
                    avatar_id,
                )];
                if character.current_health - damage_fraction <= 0.0 {
                    drafts.push(authored(
                        TransactionPayload::character_defeated(character_instance_id),
                        avatar_id,
                    ));
                }
                Ok(drafts)
            })
            .await
    }

    /// Heals a living character.
    #[tracing::instrument(skip(self))]
    pub async fn heal_character(&self, cmd: HealCharacter) -> Result<CommandOutcome> {
        let HealCharacter {
            instance_id,
            avatar_id,
            character_instance_id,
            healing_fraction,
        } = cmd;
        let rule = CharacterHealth(character_instance_id);

        self.handler
            .execute_with_rule(instance_id, Some(Arc::new(rule)), |state| {
                check_fraction(healing_fraction)?;
                living_character(state, character_instance_id)?;

                Ok(vec![authored(
                    TransactionPayload::character_healed(character_instance_id, healing_fraction),
                    avatar_id,
                )])
            })
            .await
    }

    /// Records an avatar entering or leaving.
    #[tracing::instrument(skip(self))]
    pub async fn record_presence(&self, cmd: RecordPresence) -> Result<CommandOutcome> {
        let avatar_id = cmd.avatar_id;
        let presence = cmd.presence;

        self.handler
            .execute_with_rule(cmd.instance_id, Some(Arc::new(NoConflicts)), |_| {
                let payload = match presence {
                    Presence::Entered => TransactionPayload::PlayerEntered,
                    Presence::Exited => TransactionPayload::PlayerExited,
                };
                Ok(vec![TransactionDraft::new(payload).avatar(avatar_id)])
            })
            .await
    }

    /// Logs a transaction that only read models care about.
    ///
    /// Kinds that change world state must go through their own intent so
    /// their preconditions are checked.
    #[tracing::instrument(skip(self))]
    pub async fn record_transaction(&self, cmd: RecordTransaction) -> Result<CommandOutcome> {
        let kind = cmd.payload.kind();
        if changes_world_state(kind) {
            return Err(CommandFailure::validation(
                cmd.instance_id,
                format!("{kind} transactions must be recorded through their own command"),
            )
            .into());
        }

        let RecordTransaction {
            instance_id,
            avatar_id,
            local_timestamp,
            payload,
        } = cmd;

        self.handler
            .execute_with_rule(instance_id, Some(Arc::new(NoConflicts)), |_| {
                let mut draft = authored(payload.clone(), avatar_id);
                if let Some(timestamp) = local_timestamp {
                    draft = draft.local_timestamp(timestamp);
                }
                Ok(vec![draft])
            })
            .await
    }

    /// Commits transactions appended outside a command.
    ///
    /// The batch is first replayed on top of the committed log and refused
    /// as a validation failure if that replay fails. The commit then expects
    /// no commit after the version that check read (or after
    /// `expected_commit_version`, if older), so the check cannot go stale.
    #[tracing::instrument(skip(self))]
    pub async fn commit_checked(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
        expected_commit_version: Option<CommitVersion>,
    ) -> Result<bool> {
        let instance = self.load_instance(instance_id).await?;
        self.handler
            .machine_for(&instance)?
            .preview_commit(&instance, transaction_ids)
            .map_err(|e| CommandFailure::validation(instance_id, e.to_string()))?;

        let read = instance.commit_version();
        let expected = expected_commit_version.map_or(read, |version| version.min(read));
        let committed = self
            .repository()
            .commit_transactions(
                instance_id,
                transaction_ids,
                CommitOptions::expect_commit_version(expected),
            )
            .await?;
        Ok(committed)
    }

    async fn load_instance(&self, instance_id: InstanceId) -> Result<SagaInstance> {
        Ok(self.repository().require_instance(instance_id).await?)
    }
}

fn authored(payload: TransactionPayload, avatar_id: Option<AvatarId>) -> TransactionDraft {
    let draft = TransactionDraft::new(payload);
    match avatar_id {
        Some(avatar_id) => draft.avatar(avatar_id),
        None => draft,
    }
}

fn check_fraction(fraction: f64) -> std::result::Result<(), Rejection> {
    if fraction.is_finite() && fraction > 0.0 {
        Ok(())
    } else {
        Err(Rejection::new(format!(
            "health fraction must be a positive number, got {fraction}"
        )))
    }
}

fn living_character(
    state: &SagaState,
    character_instance_id: CharacterInstanceId,
) -> std::result::Result<&CharacterState, Rejection> {
    match state.character(character_instance_id) {
        Some(character) if character.is_alive => Ok(character),
        Some(_) => Err(Rejection::new(format!(
            "character {character_instance_id} has been defeated"
        ))),
        None => Err(Rejection::new(format!(
            "character {character_instance_id} has not been spawned"
        ))),
    }
}

fn changes_world_state(kind: TransactionKind) -> bool {
    match kind {
        TransactionKind::SagaDiscovered
        | TransactionKind::SagaCompleted
        | TransactionKind::TriggerActivated
        | TransactionKind::TriggerCompleted
        | TransactionKind::CharacterSpawned
        | TransactionKind::CharacterDamaged
        | TransactionKind::CharacterHealed
        | TransactionKind::CharacterDefeated => true,
        TransactionKind::PlayerEntered
        | TransactionKind::PlayerExited
        | TransactionKind::DialogueChoiceMade
        | TransactionKind::QuestAccepted
        | TransactionKind::QuestCompleted
        | TransactionKind::LootAwarded
        | TransactionKind::ItemTraded
        | TransactionKind::ItemCrafted
        | TransactionKind::MovementClaimed
        | TransactionKind::ResourceMinedClaimed
        | TransactionKind::ToolWearClaimed => false,
    }
}

/// Commits regardless of intervening activity.
struct NoConflicts;

impl ConflictRule for NoConflicts {
    fn conflicts(&self, _committed: &SagaTransaction, _batch: &[&SagaTransaction]) -> bool {
        false
    }
}

/// Conflicts with a committed completion of one trigger.
struct TriggerCompletion(TriggerRef);

impl ConflictRule for TriggerCompletion {
    fn conflicts(&self, committed: &SagaTransaction, _batch: &[&SagaTransaction]) -> bool {
        matches!(
            committed.payload(),
            TransactionPayload::TriggerCompleted(data) if data.trigger_ref == self.0
        )
    }
}

/// Conflicts with a committed spawn of the same character id.
struct CharacterSpawn(CharacterInstanceId);

impl ConflictRule for CharacterSpawn {
    fn conflicts(&self, committed: &SagaTransaction, _batch: &[&SagaTransaction]) -> bool {
        committed.kind() == TransactionKind::CharacterSpawned
            && committed.payload().character_instance_id() == Some(self.0)
    }
}

/// Conflicts with any committed health change of one character.
struct CharacterHealth(CharacterInstanceId);

impl ConflictRule for CharacterHealth {
    fn conflicts(&self, committed: &SagaTransaction, _batch: &[&SagaTransaction]) -> bool {
        committed.kind().affects_character_health()
            && committed.payload().character_instance_id() == Some(self.0)
    }
}
