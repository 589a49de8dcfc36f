//! Derived saga state.
//!
//! Nothing here is stored. Every value is recomputed by folding the committed
//! log, and ordered collections keep the result identical across replays.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use common::{AvatarId, CharacterInstanceId, CharacterRef, InstanceId, SagaRef, TriggerRef};
use saga_log::SequenceNumber;
use serde::{Deserialize, Serialize};

/// Discovery lifecycle of a saga.
///
/// ```text
/// Undiscovered ──► Active ──► Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Nobody has found the saga yet.
    #[default]
    Undiscovered,

    /// Discovered and in progress.
    Active,

    /// Finished (terminal).
    Completed,
}

impl SagaStatus {
    /// Returns true once anyone has discovered the saga.
    pub fn is_discovered(&self) -> bool {
        !matches!(self, SagaStatus::Undiscovered)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Undiscovered => "Undiscovered",
            SagaStatus::Active => "Active",
            SagaStatus::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a trigger declared by a saga template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TriggerStatus {
    #[default]
    Inactive,
    Active,
    Completed,
}

impl TriggerStatus {
    /// Returns true if the trigger can still be activated.
    pub fn can_activate(&self) -> bool {
        !matches!(self, TriggerStatus::Completed)
    }

    /// Returns true if the trigger can be completed.
    pub fn can_complete(&self) -> bool {
        matches!(self, TriggerStatus::Active)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Inactive => "Inactive",
            TriggerStatus::Active => "Active",
            TriggerStatus::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of one trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerState {
    pub status: TriggerStatus,
    pub activation_count: u32,
    pub first_activated_at: Option<DateTime<Utc>>,
    pub last_activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub triggered_by_avatars: BTreeSet<AvatarId>,
}

/// State of one spawned character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub character_ref: CharacterRef,
    pub spawned_by_trigger_ref: Option<TriggerRef>,
    pub spawned_at: DateTime<Utc>,
    pub defeated_at: Option<DateTime<Utc>>,
    /// Fraction of full health. Not clamped: damage can push it below zero
    /// until a defeat transaction settles it at 0.0.
    pub current_health: f64,
    pub is_alive: bool,
    pub damage_by_avatar: BTreeMap<AvatarId, f64>,
}

impl CharacterState {
    /// Creates a freshly spawned character at full health.
    pub fn spawned(
        character_ref: CharacterRef,
        spawned_by_trigger_ref: Option<TriggerRef>,
        spawned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            character_ref,
            spawned_by_trigger_ref,
            spawned_at,
            defeated_at: None,
            current_health: 1.0,
            is_alive: true,
            damage_by_avatar: BTreeMap::new(),
        }
    }

    /// Returns the damage one avatar has dealt.
    pub fn damage_by(&self, avatar_id: AvatarId) -> f64 {
        self.damage_by_avatar.get(&avatar_id).copied().unwrap_or(0.0)
    }

    /// Returns the avatars that dealt any damage.
    pub fn contributors(&self) -> impl Iterator<Item = AvatarId> + '_ {
        self.damage_by_avatar.keys().copied()
    }
}

/// World state of one saga instance at some point in its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub instance_id: InstanceId,
    pub saga_ref: SagaRef,
    pub status: SagaStatus,
    pub first_discovered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discovered_by_avatars: BTreeSet<AvatarId>,
    pub completed_by_avatars: BTreeSet<AvatarId>,
    pub triggers: BTreeMap<TriggerRef, TriggerState>,
    pub characters: BTreeMap<CharacterInstanceId, CharacterState>,
    /// Number of committed transactions folded into this state.
    pub transaction_count: u64,
    /// Sequence number of the last folded transaction.
    pub last_sequence_number: Option<SequenceNumber>,
}

impl SagaState {
    /// Creates the state of an instance before any transaction.
    pub fn initial(instance_id: InstanceId, saga_ref: SagaRef) -> Self {
        Self {
            instance_id,
            saga_ref,
            status: SagaStatus::Undiscovered,
            first_discovered_at: None,
            completed_at: None,
            discovered_by_avatars: BTreeSet::new(),
            completed_by_avatars: BTreeSet::new(),
            triggers: BTreeMap::new(),
            characters: BTreeMap::new(),
            transaction_count: 0,
            last_sequence_number: None,
        }
    }

    /// Looks up a trigger.
    pub fn trigger(&self, trigger_ref: &TriggerRef) -> Option<&TriggerState> {
        self.triggers.get(trigger_ref)
    }

    /// Looks up a character.
    pub fn character(&self, id: CharacterInstanceId) -> Option<&CharacterState> {
        self.characters.get(&id)
    }

    /// Returns the characters still alive.
    pub fn living_characters(&self) -> impl Iterator<Item = (&CharacterInstanceId, &CharacterState)> {
        self.characters.iter().filter(|(_, c)| c.is_alive)
    }
}
