//! Achievement read model: per-avatar saga progress and boss credits.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AvatarId, CharacterInstanceId, CharacterRef, InstanceId, QuestRef, SagaRef, TriggerRef};
use saga_log::{LoggedTransaction, TransactionId, TransactionPayload};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{Projection, ProjectionPosition};
use crate::read_model::ReadModel;

/// Credit for helping defeat a character.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefeatCredit {
    pub instance_id: InstanceId,
    pub character_instance_id: CharacterInstanceId,
    pub character_ref: Option<CharacterRef>,
    /// Total damage fraction this avatar dealt to the character.
    pub damage_dealt: f64,
    pub defeated_at: DateTime<Utc>,
}

/// Everything one avatar has achieved across sagas.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AvatarAchievements {
    pub sagas_discovered: BTreeSet<SagaRef>,
    pub sagas_completed: BTreeSet<SagaRef>,
    pub triggers_activated: BTreeSet<(SagaRef, TriggerRef)>,
    pub quests_completed: BTreeSet<QuestRef>,
    pub defeats: Vec<DefeatCredit>,
}

/// Damage dealt to one character so far, waiting for its defeat.
#[derive(Default)]
struct CharacterTally {
    character_ref: Option<CharacterRef>,
    damage_by_avatar: BTreeMap<AvatarId, f64>,
}

/// Internal state for the achievement view.
#[derive(Default)]
struct AchievementState {
    avatars: HashMap<AvatarId, AvatarAchievements>,
    characters: HashMap<(InstanceId, CharacterInstanceId), CharacterTally>,
    applied: HashSet<TransactionId>,
    position: ProjectionPosition,
}

impl AchievementState {
    fn avatar(&mut self, avatar_id: AvatarId) -> &mut AvatarAchievements {
        self.avatars.entry(avatar_id).or_default()
    }
}

/// Read model view syncing avatar achievements from the saga log.
///
/// When a character is defeated, every avatar that damaged it is credited
/// with the defeat, not only the one that landed the last blow.
#[derive(Clone, Default)]
pub struct AchievementView {
    state: Arc<RwLock<AchievementState>>,
}

impl AchievementView {
    /// Creates a new empty achievement view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the achievements of one avatar.
    pub async fn get_achievements(&self, avatar_id: AvatarId) -> Option<AvatarAchievements> {
        self.state.read().await.avatars.get(&avatar_id).cloned()
    }

    /// Gets the avatars that have completed a saga.
    pub async fn completed_by(&self, saga_ref: &SagaRef) -> Vec<AvatarId> {
        let state = self.state.read().await;
        let mut avatars: Vec<_> = state
            .avatars
            .iter()
            .filter(|(_, a)| a.sagas_completed.contains(saga_ref))
            .map(|(id, _)| *id)
            .collect();
        avatars.sort();
        avatars
    }
}

#[async_trait]
impl Projection for AchievementView {
    fn name(&self) -> &'static str {
        "AchievementView"
    }

    async fn handle(&self, logged: &LoggedTransaction) -> Result<()> {
        let tx = &logged.transaction;
        let mut state = self.state.write().await;
        if !state.applied.insert(tx.transaction_id()) {
            return Ok(());
        }

        let saga_ref = &logged.saga_ref;
        match (tx.payload(), tx.avatar_id()) {
            (TransactionPayload::SagaDiscovered, Some(avatar_id)) => {
                state.avatar(avatar_id).sagas_discovered.insert(saga_ref.clone());
            }
            (TransactionPayload::SagaCompleted, Some(avatar_id)) => {
                state.avatar(avatar_id).sagas_completed.insert(saga_ref.clone());
            }
            (TransactionPayload::TriggerActivated(data), Some(avatar_id)) => {
                state
                    .avatar(avatar_id)
                    .triggers_activated
                    .insert((saga_ref.clone(), data.trigger_ref.clone()));
            }
            (TransactionPayload::QuestCompleted(data), Some(avatar_id)) => {
                state
                    .avatar(avatar_id)
                    .quests_completed
                    .insert(data.quest_ref.clone());
            }
            (TransactionPayload::CharacterSpawned(data), _) => {
                state
                    .characters
                    .entry((logged.instance_id, data.character_instance_id))
                    .or_default()
                    .character_ref = Some(data.character_ref.clone());
            }
            (TransactionPayload::CharacterDamaged(data), Some(avatar_id)) => {
                *state
                    .characters
                    .entry((logged.instance_id, data.character_instance_id))
                    .or_default()
                    .damage_by_avatar
                    .entry(avatar_id)
                    .or_insert(0.0) += data.damage_fraction;
            }
            (TransactionPayload::CharacterDefeated(data), _) => {
                let key = (logged.instance_id, data.character_instance_id);
                if let Some(tally) = state.characters.remove(&key) {
                    for (avatar_id, damage_dealt) in tally.damage_by_avatar {
                        state.avatar(avatar_id).defeats.push(DefeatCredit {
                            instance_id: logged.instance_id,
                            character_instance_id: data.character_instance_id,
                            character_ref: tally.character_ref.clone(),
                            damage_dealt,
                            defeated_at: tx.server_timestamp(),
                        });
                    }
                    metrics::counter!("achievements_defeats_credited").increment(1);
                }
            }
            _ => {}
        }

        state.position = state.position.advance();
        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        self.state.read().await.position
    }

    async fn reset(&self) -> Result<()> {
        *self.state.write().await = AchievementState::default();
        Ok(())
    }
}

impl ReadModel for AchievementView {
    fn name(&self) -> &'static str {
        "AchievementView"
    }

    fn count(&self) -> usize {
        self.state
            .try_read()
            .map(|s| s.avatars.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_log::payload::QuestData;
    use saga_log::{SagaInstance, TransactionDraft};

    fn logged(saga: &str, drafts: Vec<TransactionDraft>) -> Vec<LoggedTransaction> {
        let mut instance = SagaInstance::shared(SagaRef::new(saga));
        instance.add_transactions(drafts).unwrap();
        instance
            .transactions()
            .iter()
            .cloned()
            .map(|transaction| LoggedTransaction {
                instance_id: instance.instance_id(),
                saga_ref: SagaRef::new(saga),
                transaction,
            })
            .collect()
    }

    async fn apply_all(view: &AchievementView, transactions: &[LoggedTransaction]) {
        for tx in transactions {
            view.handle(tx).await.unwrap();
        }
    }

    #[tokio::test]
    async fn tracks_discovery_completion_and_triggers() {
        let view = AchievementView::new();
        let avatar = AvatarId::new();

        apply_all(
            &view,
            &logged(
                "crypt",
                vec![
                    TransactionDraft::new(TransactionPayload::SagaDiscovered).avatar(avatar),
                    TransactionDraft::new(TransactionPayload::trigger_activated("approach"))
                        .avatar(avatar),
                    TransactionDraft::new(TransactionPayload::QuestCompleted(QuestData {
                        quest_ref: "lost_ring".into(),
                    }))
                    .avatar(avatar),
                    TransactionDraft::new(TransactionPayload::SagaCompleted).avatar(avatar),
                ],
            ),
        )
        .await;

        let achievements = view.get_achievements(avatar).await.unwrap();
        let crypt = SagaRef::new("crypt");
        assert!(achievements.sagas_discovered.contains(&crypt));
        assert!(achievements.sagas_completed.contains(&crypt));
        assert!(
            achievements
                .triggers_activated
                .contains(&(crypt.clone(), TriggerRef::new("approach")))
        );
        assert!(achievements.quests_completed.contains(&QuestRef::new("lost_ring")));
        assert_eq!(view.completed_by(&crypt).await, vec![avatar]);
    }

    #[tokio::test]
    async fn defeat_credits_every_contributor() {
        let view = AchievementView::new();
        let (player1, player2, bystander) = (AvatarId::new(), AvatarId::new(), AvatarId::new());
        let boss = CharacterInstanceId::new();

        apply_all(
            &view,
            &logged(
                "crypt",
                vec![
                    TransactionDraft::new(TransactionPayload::PlayerEntered).avatar(bystander),
                    TransactionDraft::new(TransactionPayload::character_spawned(boss, "TestBoss", None)),
                    TransactionDraft::new(TransactionPayload::character_damaged(boss, 0.4))
                        .avatar(player1),
                    TransactionDraft::new(TransactionPayload::character_damaged(boss, 0.6))
                        .avatar(player2),
                    TransactionDraft::new(TransactionPayload::character_defeated(boss)),
                ],
            ),
        )
        .await;

        let p1 = view.get_achievements(player1).await.unwrap();
        assert_eq!(p1.defeats.len(), 1);
        assert_eq!(p1.defeats[0].character_ref, Some(CharacterRef::new("TestBoss")));
        assert_eq!(p1.defeats[0].damage_dealt, 0.4);

        let p2 = view.get_achievements(player2).await.unwrap();
        assert_eq!(p2.defeats[0].damage_dealt, 0.6);

        assert!(view.get_achievements(bystander).await.is_none());
    }

    #[tokio::test]
    async fn redelivered_transactions_are_not_counted_twice() {
        let view = AchievementView::new();
        let avatar = AvatarId::new();
        let boss = CharacterInstanceId::new();
        let transactions = logged(
            "crypt",
            vec![
                TransactionDraft::new(TransactionPayload::character_spawned(boss, "TestBoss", None)),
                TransactionDraft::new(TransactionPayload::character_damaged(boss, 0.5)).avatar(avatar),
                TransactionDraft::new(TransactionPayload::character_defeated(boss)),
            ],
        );

        apply_all(&view, &transactions[..2]).await;
        apply_all(&view, &transactions[..2]).await;
        apply_all(&view, &transactions).await;
        apply_all(&view, &transactions).await;

        let achievements = view.get_achievements(avatar).await.unwrap();
        assert_eq!(achievements.defeats.len(), 1);
        assert_eq!(achievements.defeats[0].damage_dealt, 0.5);
        assert_eq!(view.position().await.transactions_applied, 3);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let view = AchievementView::new();
        let avatar = AvatarId::new();
        apply_all(
            &view,
            &logged(
                "crypt",
                vec![TransactionDraft::new(TransactionPayload::SagaDiscovered).avatar(avatar)],
            ),
        )
        .await;
        assert_eq!(ReadModel::count(&view), 1);

        view.reset().await.unwrap();

        assert_eq!(ReadModel::count(&view), 0);
        assert_eq!(view.position().await, ProjectionPosition::zero());
    }
}
