//! Saga commands.

use chrono::{DateTime, Utc};
use common::{AvatarId, CharacterInstanceId, CharacterRef, InstanceId, TriggerRef};
use saga_log::TransactionPayload;

/// Command recording that an avatar discovered the saga.
#[derive(Debug, Clone)]
pub struct DiscoverSaga {
    pub instance_id: InstanceId,
    pub avatar_id: AvatarId,
}

impl DiscoverSaga {
    /// Creates a new DiscoverSaga command.
    pub fn new(instance_id: InstanceId, avatar_id: AvatarId) -> Self {
        Self {
            instance_id,
            avatar_id,
        }
    }
}

/// Command recording that an avatar completed the saga.
#[derive(Debug, Clone)]
pub struct CompleteSaga {
    pub instance_id: InstanceId,
    pub avatar_id: AvatarId,
}

impl CompleteSaga {
    /// Creates a new CompleteSaga command.
    pub fn new(instance_id: InstanceId, avatar_id: AvatarId) -> Self {
        Self {
            instance_id,
            avatar_id,
        }
    }
}

/// Command activating a trigger.
#[derive(Debug, Clone)]
pub struct ActivateTrigger {
    pub instance_id: InstanceId,

    /// The avatar that set the trigger off, or None for the world.
    pub avatar_id: Option<AvatarId>,

    pub trigger_ref: TriggerRef,
}

impl ActivateTrigger {
    /// Creates a new ActivateTrigger command.
    pub fn new(
        instance_id: InstanceId,
        avatar_id: Option<AvatarId>,
        trigger_ref: impl Into<TriggerRef>,
    ) -> Self {
        Self {
            instance_id,
            avatar_id,
            trigger_ref: trigger_ref.into(),
        }
    }
}

/// Command completing an active trigger.
#[derive(Debug, Clone)]
pub struct CompleteTrigger {
    pub instance_id: InstanceId,
    pub avatar_id: Option<AvatarId>,
    pub trigger_ref: TriggerRef,
}

impl CompleteTrigger {
    /// Creates a new CompleteTrigger command.
    pub fn new(
        instance_id: InstanceId,
        avatar_id: Option<AvatarId>,
        trigger_ref: impl Into<TriggerRef>,
    ) -> Self {
        Self {
            instance_id,
            avatar_id,
            trigger_ref: trigger_ref.into(),
        }
    }
}

/// Command spawning a character into the instance.
#[derive(Debug, Clone)]
pub struct SpawnCharacter {
    pub instance_id: InstanceId,

    /// The id the new character will be known by.
    pub character_instance_id: CharacterInstanceId,

    pub character_ref: CharacterRef,
    pub spawned_by_trigger_ref: Option<TriggerRef>,
}

impl SpawnCharacter {
    /// Creates a new SpawnCharacter command with a generated character id.
    pub fn new(instance_id: InstanceId, character_ref: impl Into<CharacterRef>) -> Self {
        Self {
            instance_id,
            character_instance_id: CharacterInstanceId::new(),
            character_ref: character_ref.into(),
            spawned_by_trigger_ref: None,
        }
    }

    /// Uses a caller-chosen character id.
    pub fn with_id(mut self, character_instance_id: CharacterInstanceId) -> Self {
        self.character_instance_id = character_instance_id;
        self
    }

    /// Records the trigger that caused the spawn.
    pub fn from_trigger(mut self, trigger_ref: impl Into<TriggerRef>) -> Self {
        self.spawned_by_trigger_ref = Some(trigger_ref.into());
        self
    }
}

/// Command dealing damage to a character.
#[derive(Debug, Clone)]
pub struct DamageCharacter {
    pub instance_id: InstanceId,
    pub avatar_id: Option<AvatarId>,
    pub character_instance_id: CharacterInstanceId,

    /// Fraction of full health removed.
    pub damage_fraction: f64,
}

impl DamageCharacter {
    /// Creates a new DamageCharacter command.
    pub fn new(
        instance_id: InstanceId,
        avatar_id: Option<AvatarId>,
        character_instance_id: CharacterInstanceId,
        damage_fraction: f64,
    ) -> Self {
        Self {
            instance_id,
            avatar_id,
            character_instance_id,
            damage_fraction,
        }
    }
}

/// Command restoring health to a character.
#[derive(Debug, Clone)]
pub struct HealCharacter {
    pub instance_id: InstanceId,
    pub avatar_id: Option<AvatarId>,
    pub character_instance_id: CharacterInstanceId,
    pub healing_fraction: f64,
}

impl HealCharacter {
    /// Creates a new HealCharacter command.
    pub fn new(
        instance_id: InstanceId,
        avatar_id: Option<AvatarId>,
        character_instance_id: CharacterInstanceId,
        healing_fraction: f64,
    ) -> Self {
        Self {
            instance_id,
            avatar_id,
            character_instance_id,
            healing_fraction,
        }
    }
}

/// Whether an avatar arrived or left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Entered,
    Exited,
}

/// Command recording an avatar entering or leaving the saga area.
#[derive(Debug, Clone)]
pub struct RecordPresence {
    pub instance_id: InstanceId,
    pub avatar_id: AvatarId,
    pub presence: Presence,
}

impl RecordPresence {
    /// Creates a RecordPresence command for an arrival.
    pub fn entered(instance_id: InstanceId, avatar_id: AvatarId) -> Self {
        Self {
            instance_id,
            avatar_id,
            presence: Presence::Entered,
        }
    }

    /// Creates a RecordPresence command for a departure.
    pub fn exited(instance_id: InstanceId, avatar_id: AvatarId) -> Self {
        Self {
            instance_id,
            avatar_id,
            presence: Presence::Exited,
        }
    }
}

/// Command logging a transaction that has no world-state effect, such as a
/// dialogue choice, an inventory change or a client claim.
#[derive(Debug, Clone)]
pub struct RecordTransaction {
    pub instance_id: InstanceId,
    pub avatar_id: Option<AvatarId>,

    /// Client clock at the time of the event. Untrusted.
    pub local_timestamp: Option<DateTime<Utc>>,

    pub payload: TransactionPayload,
}

impl RecordTransaction {
    /// Creates a new RecordTransaction command.
    pub fn new(
        instance_id: InstanceId,
        avatar_id: Option<AvatarId>,
        payload: TransactionPayload,
    ) -> Self {
        Self {
            instance_id,
            avatar_id,
            local_timestamp: None,
            payload,
        }
    }

    /// Attaches the client-supplied timestamp.
    pub fn at_local_time(mut self, timestamp: DateTime<Utc>) -> Self {
        self.local_timestamp = Some(timestamp);
        self
    }
}
