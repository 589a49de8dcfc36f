//! Typed transaction payloads.
//!
//! Each transaction kind carries exactly one payload shape. Payloads are
//! decoded once when they enter the log; everything downstream works on the
//! typed values.

use std::str::FromStr;

use common::{
    AvatarId, CharacterInstanceId, CharacterRef, DialogueRef, ItemRef, QuestRef, TriggerRef,
};
use serde::{Deserialize, Serialize};

use crate::{Result, SagaLogError};

/// The closed set of transaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    SagaDiscovered,
    SagaCompleted,
    TriggerActivated,
    TriggerCompleted,
    CharacterSpawned,
    CharacterDamaged,
    CharacterHealed,
    CharacterDefeated,
    PlayerEntered,
    PlayerExited,
    DialogueChoiceMade,
    QuestAccepted,
    QuestCompleted,
    LootAwarded,
    ItemTraded,
    ItemCrafted,
    MovementClaimed,
    ResourceMinedClaimed,
    ToolWearClaimed,
}

impl TransactionKind {
    /// Every kind, in declaration order.
    pub const ALL: [TransactionKind; 19] = [
        Self::SagaDiscovered,
        Self::SagaCompleted,
        Self::TriggerActivated,
        Self::TriggerCompleted,
        Self::CharacterSpawned,
        Self::CharacterDamaged,
        Self::CharacterHealed,
        Self::CharacterDefeated,
        Self::PlayerEntered,
        Self::PlayerExited,
        Self::DialogueChoiceMade,
        Self::QuestAccepted,
        Self::QuestCompleted,
        Self::LootAwarded,
        Self::ItemTraded,
        Self::ItemCrafted,
        Self::MovementClaimed,
        Self::ResourceMinedClaimed,
        Self::ToolWearClaimed,
    ];

    /// Returns the wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SagaDiscovered => "SagaDiscovered",
            Self::SagaCompleted => "SagaCompleted",
            Self::TriggerActivated => "TriggerActivated",
            Self::TriggerCompleted => "TriggerCompleted",
            Self::CharacterSpawned => "CharacterSpawned",
            Self::CharacterDamaged => "CharacterDamaged",
            Self::CharacterHealed => "CharacterHealed",
            Self::CharacterDefeated => "CharacterDefeated",
            Self::PlayerEntered => "PlayerEntered",
            Self::PlayerExited => "PlayerExited",
            Self::DialogueChoiceMade => "DialogueChoiceMade",
            Self::QuestAccepted => "QuestAccepted",
            Self::QuestCompleted => "QuestCompleted",
            Self::LootAwarded => "LootAwarded",
            Self::ItemTraded => "ItemTraded",
            Self::ItemCrafted => "ItemCrafted",
            Self::MovementClaimed => "MovementClaimed",
            Self::ResourceMinedClaimed => "ResourceMinedClaimed",
            Self::ToolWearClaimed => "ToolWearClaimed",
        }
    }

    /// Returns true if the kind touches the health of a spawned character.
    pub fn affects_character_health(&self) -> bool {
        matches!(
            self,
            Self::CharacterDamaged | Self::CharacterHealed | Self::CharacterDefeated
        )
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = SagaLogError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SagaLogError::UnknownTransactionKind(s.to_string()))
    }
}

/// Typed payload of a transaction, one variant per [`TransactionKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransactionPayload {
    /// An avatar found the saga.
    SagaDiscovered,

    /// An avatar finished the saga.
    SagaCompleted,

    /// A trigger fired.
    TriggerActivated(TriggerData),

    /// A trigger was resolved.
    TriggerCompleted(TriggerData),

    /// A character appeared in the instance.
    CharacterSpawned(CharacterSpawnedData),

    /// A character lost a fraction of its health.
    CharacterDamaged(CharacterDamagedData),

    /// A character regained a fraction of its health.
    CharacterHealed(CharacterHealedData),

    /// A character was defeated.
    CharacterDefeated(CharacterData),

    /// An avatar entered the instance.
    PlayerEntered,

    /// An avatar left the instance.
    PlayerExited,

    /// An avatar picked a dialogue option.
    DialogueChoiceMade(DialogueChoiceData),

    /// An avatar accepted a quest.
    QuestAccepted(QuestData),

    /// An avatar finished a quest.
    QuestCompleted(QuestData),

    /// Items were granted to the acting avatar.
    LootAwarded(LootAwardedData),

    /// The acting avatar handed items to another avatar.
    ItemTraded(ItemTradedData),

    /// The acting avatar crafted items from ingredients.
    ItemCrafted(ItemCraftedData),

    /// Client claim: the avatar moved to a position.
    MovementClaimed(MovementClaimData),

    /// Client claim: the avatar mined a resource.
    ResourceMinedClaimed(ResourceMinedData),

    /// Client claim: a tool wore down.
    ToolWearClaimed(ToolWearData),
}

impl TransactionPayload {
    /// Returns the kind of this payload.
    pub fn kind(&self) -> TransactionKind {
        match self {
            Self::SagaDiscovered => TransactionKind::SagaDiscovered,
            Self::SagaCompleted => TransactionKind::SagaCompleted,
            Self::TriggerActivated(_) => TransactionKind::TriggerActivated,
            Self::TriggerCompleted(_) => TransactionKind::TriggerCompleted,
            Self::CharacterSpawned(_) => TransactionKind::CharacterSpawned,
            Self::CharacterDamaged(_) => TransactionKind::CharacterDamaged,
            Self::CharacterHealed(_) => TransactionKind::CharacterHealed,
            Self::CharacterDefeated(_) => TransactionKind::CharacterDefeated,
            Self::PlayerEntered => TransactionKind::PlayerEntered,
            Self::PlayerExited => TransactionKind::PlayerExited,
            Self::DialogueChoiceMade(_) => TransactionKind::DialogueChoiceMade,
            Self::QuestAccepted(_) => TransactionKind::QuestAccepted,
            Self::QuestCompleted(_) => TransactionKind::QuestCompleted,
            Self::LootAwarded(_) => TransactionKind::LootAwarded,
            Self::ItemTraded(_) => TransactionKind::ItemTraded,
            Self::ItemCrafted(_) => TransactionKind::ItemCrafted,
            Self::MovementClaimed(_) => TransactionKind::MovementClaimed,
            Self::ResourceMinedClaimed(_) => TransactionKind::ResourceMinedClaimed,
            Self::ToolWearClaimed(_) => TransactionKind::ToolWearClaimed,
        }
    }

    /// Returns the character a payload refers to, if any.
    pub fn character_instance_id(&self) -> Option<CharacterInstanceId> {
        match self {
            Self::CharacterSpawned(data) => Some(data.character_instance_id),
            Self::CharacterDamaged(data) => Some(data.character_instance_id),
            Self::CharacterHealed(data) => Some(data.character_instance_id),
            Self::CharacterDefeated(data) => Some(data.character_instance_id),
            _ => None,
        }
    }

    /// Decodes a payload from its kind name and its data document.
    ///
    /// Fails with [`SagaLogError::UnknownTransactionKind`] when the name is not
    /// one this build knows, so a log written by a newer producer is never
    /// replayed with pieces silently missing.
    pub fn decode(kind: &str, data: serde_json::Value) -> Result<Self> {
        let kind: TransactionKind = kind.parse()?;
        let payload = match kind {
            TransactionKind::SagaDiscovered => Self::SagaDiscovered,
            TransactionKind::SagaCompleted => Self::SagaCompleted,
            TransactionKind::TriggerActivated => Self::TriggerActivated(serde_json::from_value(data)?),
            TransactionKind::TriggerCompleted => Self::TriggerCompleted(serde_json::from_value(data)?),
            TransactionKind::CharacterSpawned => Self::CharacterSpawned(serde_json::from_value(data)?),
            TransactionKind::CharacterDamaged => Self::CharacterDamaged(serde_json::from_value(data)?),
            TransactionKind::CharacterHealed => Self::CharacterHealed(serde_json::from_value(data)?),
            TransactionKind::CharacterDefeated => {
                Self::CharacterDefeated(serde_json::from_value(data)?)
            }
            TransactionKind::PlayerEntered => Self::PlayerEntered,
            TransactionKind::PlayerExited => Self::PlayerExited,
            TransactionKind::DialogueChoiceMade => {
                Self::DialogueChoiceMade(serde_json::from_value(data)?)
            }
            TransactionKind::QuestAccepted => Self::QuestAccepted(serde_json::from_value(data)?),
            TransactionKind::QuestCompleted => Self::QuestCompleted(serde_json::from_value(data)?),
            TransactionKind::LootAwarded => Self::LootAwarded(serde_json::from_value(data)?),
            TransactionKind::ItemTraded => Self::ItemTraded(serde_json::from_value(data)?),
            TransactionKind::ItemCrafted => Self::ItemCrafted(serde_json::from_value(data)?),
            TransactionKind::MovementClaimed => Self::MovementClaimed(serde_json::from_value(data)?),
            TransactionKind::ResourceMinedClaimed => {
                Self::ResourceMinedClaimed(serde_json::from_value(data)?)
            }
            TransactionKind::ToolWearClaimed => Self::ToolWearClaimed(serde_json::from_value(data)?),
        };
        Ok(payload)
    }

    /// Encodes the data part of the payload. Inverse of [`Self::decode`].
    pub fn encode_data(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::SagaDiscovered | Self::SagaCompleted | Self::PlayerEntered | Self::PlayerExited => {
                serde_json::Value::Null
            }
            Self::TriggerActivated(data) | Self::TriggerCompleted(data) => serde_json::to_value(data)?,
            Self::CharacterSpawned(data) => serde_json::to_value(data)?,
            Self::CharacterDamaged(data) => serde_json::to_value(data)?,
            Self::CharacterHealed(data) => serde_json::to_value(data)?,
            Self::CharacterDefeated(data) => serde_json::to_value(data)?,
            Self::DialogueChoiceMade(data) => serde_json::to_value(data)?,
            Self::QuestAccepted(data) | Self::QuestCompleted(data) => serde_json::to_value(data)?,
            Self::LootAwarded(data) => serde_json::to_value(data)?,
            Self::ItemTraded(data) => serde_json::to_value(data)?,
            Self::ItemCrafted(data) => serde_json::to_value(data)?,
            Self::MovementClaimed(data) => serde_json::to_value(data)?,
            Self::ResourceMinedClaimed(data) => serde_json::to_value(data)?,
            Self::ToolWearClaimed(data) => serde_json::to_value(data)?,
        };
        Ok(value)
    }
}

/// Data for trigger events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerData {
    pub trigger_ref: TriggerRef,
}

/// Data for CharacterSpawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSpawnedData {
    pub character_instance_id: CharacterInstanceId,
    pub character_ref: CharacterRef,
    /// The trigger that caused the spawn, absent for ambient spawns.
    #[serde(default)]
    pub spawned_by_trigger_ref: Option<TriggerRef>,
}

/// Data for CharacterDamaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDamagedData {
    pub character_instance_id: CharacterInstanceId,
    /// Fraction of full health removed, e.g. `0.3` for 30%.
    pub damage_fraction: f64,
}

/// Data for CharacterHealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterHealedData {
    pub character_instance_id: CharacterInstanceId,
    pub healing_fraction: f64,
}

/// Data for events that only name a character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterData {
    pub character_instance_id: CharacterInstanceId,
}

/// Data for DialogueChoiceMade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueChoiceData {
    pub character_ref: CharacterRef,
    pub dialogue_ref: DialogueRef,
    pub choice_ref: String,
}

/// Data for quest events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestData {
    pub quest_ref: QuestRef,
}

/// Data for LootAwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootAwardedData {
    pub item_ref: ItemRef,
    pub quantity: u32,
    #[serde(default)]
    pub source_character_instance_id: Option<CharacterInstanceId>,
}

/// Data for ItemTraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTradedData {
    pub item_ref: ItemRef,
    pub quantity: u32,
    pub counterparty_avatar_id: AvatarId,
}

/// One ingredient consumed by a craft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemQuantity {
    pub item_ref: ItemRef,
    pub quantity: u32,
}

/// Data for ItemCrafted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCraftedData {
    pub item_ref: ItemRef,
    pub quantity: u32,
    #[serde(default)]
    pub consumed: Vec<ItemQuantity>,
}

/// A point on the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
}

/// Data for MovementClaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementClaimData {
    pub position: GeoPosition,
    /// Speed reported by the client in metres per second.
    #[serde(default)]
    pub claimed_speed: Option<f64>,
}

/// Data for ResourceMinedClaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMinedData {
    pub resource_ref: String,
    pub item_ref: ItemRef,
    pub quantity: u32,
    pub position: GeoPosition,
}

/// Data for ToolWearClaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolWearData {
    pub tool_ref: ItemRef,
    pub wear_fraction: f64,
}

// Convenience constructors
impl TransactionPayload {
    /// Creates a TriggerActivated payload.
    pub fn trigger_activated(trigger_ref: impl Into<TriggerRef>) -> Self {
        Self::TriggerActivated(TriggerData {
            trigger_ref: trigger_ref.into(),
        })
    }

    /// Creates a TriggerCompleted payload.
    pub fn trigger_completed(trigger_ref: impl Into<TriggerRef>) -> Self {
        Self::TriggerCompleted(TriggerData {
            trigger_ref: trigger_ref.into(),
        })
    }

    /// Creates a CharacterSpawned payload.
    pub fn character_spawned(
        character_instance_id: CharacterInstanceId,
        character_ref: impl Into<CharacterRef>,
        spawned_by_trigger_ref: Option<TriggerRef>,
    ) -> Self {
        Self::CharacterSpawned(CharacterSpawnedData {
            character_instance_id,
            character_ref: character_ref.into(),
            spawned_by_trigger_ref,
        })
    }

    /// Creates a CharacterDamaged payload.
    pub fn character_damaged(character_instance_id: CharacterInstanceId, damage_fraction: f64) -> Self {
        Self::CharacterDamaged(CharacterDamagedData {
            character_instance_id,
            damage_fraction,
        })
    }

    /// Creates a CharacterHealed payload.
    pub fn character_healed(character_instance_id: CharacterInstanceId, healing_fraction: f64) -> Self {
        Self::CharacterHealed(CharacterHealedData {
            character_instance_id,
            healing_fraction,
        })
    }

    /// Creates a CharacterDefeated payload.
    pub fn character_defeated(character_instance_id: CharacterInstanceId) -> Self {
        Self::CharacterDefeated(CharacterData {
            character_instance_id,
        })
    }

    /// Creates a LootAwarded payload.
    pub fn loot_awarded(item_ref: impl Into<ItemRef>, quantity: u32) -> Self {
        Self::LootAwarded(LootAwardedData {
            item_ref: item_ref.into(),
            quantity,
            source_character_instance_id: None,
        })
    }
}
