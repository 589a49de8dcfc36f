//! Avatar inventory read model: item counts per avatar.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::{AvatarId, ItemRef};
use saga_log::{LoggedTransaction, TransactionId, TransactionPayload};
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{Projection, ProjectionPosition};
use crate::read_model::ReadModel;

/// Internal state for the inventory view.
#[derive(Default)]
struct InventoryState {
    inventories: HashMap<AvatarId, BTreeMap<ItemRef, u64>>,
    applied: HashSet<TransactionId>,
    position: ProjectionPosition,
}

impl InventoryState {
    fn add(&mut self, avatar_id: AvatarId, item_ref: &ItemRef, quantity: u32) {
        *self
            .inventories
            .entry(avatar_id)
            .or_default()
            .entry(item_ref.clone())
            .or_insert(0) += u64::from(quantity);
    }

    /// Removes up to `quantity`, returning how many were missing.
    fn remove(&mut self, avatar_id: AvatarId, item_ref: &ItemRef, quantity: u32) -> u64 {
        let wanted = u64::from(quantity);
        let Some(items) = self.inventories.get_mut(&avatar_id) else {
            return wanted;
        };
        let Some(held) = items.get_mut(item_ref) else {
            return wanted;
        };

        let missing = wanted.saturating_sub(*held);
        *held = held.saturating_sub(wanted);
        if *held == 0 {
            items.remove(item_ref);
        }
        missing
    }
}

/// Read model view for what each avatar is carrying.
///
/// Loot, mining claims and craft outputs add items; trades move them to
/// the counterparty; crafting removes the consumed ingredients. Counts never
/// go below zero: removing more than the avatar holds is logged and clamped.
#[derive(Clone, Default)]
pub struct AvatarInventoryView {
    state: Arc<RwLock<InventoryState>>,
}

impl AvatarInventoryView {
    /// Creates a new empty inventory view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets an avatar's inventory, sorted by item.
    pub async fn get_inventory(&self, avatar_id: AvatarId) -> BTreeMap<ItemRef, u64> {
        self.state
            .read()
            .await
            .inventories
            .get(&avatar_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Gets how many of one item an avatar holds.
    pub async fn quantity(&self, avatar_id: AvatarId, item_ref: &ItemRef) -> u64 {
        self.state
            .read()
            .await
            .inventories
            .get(&avatar_id)
            .and_then(|items| items.get(item_ref))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Projection for AvatarInventoryView {
    fn name(&self) -> &'static str {
        "AvatarInventoryView"
    }

    async fn handle(&self, logged: &LoggedTransaction) -> Result<()> {
        let tx = &logged.transaction;
        let mut state = self.state.write().await;
        if !state.applied.insert(tx.transaction_id()) {
            return Ok(());
        }

        if let Some(avatar_id) = tx.avatar_id() {
            match tx.payload() {
                TransactionPayload::LootAwarded(data) => {
                    state.add(avatar_id, &data.item_ref, data.quantity);
                }
                TransactionPayload::ResourceMinedClaimed(data) => {
                    state.add(avatar_id, &data.item_ref, data.quantity);
                }
                TransactionPayload::ItemTraded(data) => {
                    let missing = state.remove(avatar_id, &data.item_ref, data.quantity);
                    if missing > 0 {
                        tracing::warn!(
                            transaction_id = %tx.transaction_id(),
                            %avatar_id,
                            item_ref = %data.item_ref,
                            missing,
                            "trade exceeds held quantity"
                        );
                    }
                    state.add(data.counterparty_avatar_id, &data.item_ref, data.quantity);
                }
                TransactionPayload::ItemCrafted(data) => {
                    for ingredient in &data.consumed {
                        let missing =
                            state.remove(avatar_id, &ingredient.item_ref, ingredient.quantity);
                        if missing > 0 {
                            tracing::warn!(
                                transaction_id = %tx.transaction_id(),
                                %avatar_id,
                                item_ref = %ingredient.item_ref,
                                missing,
                                "craft consumed more than held"
                            );
                        }
                    }
                    state.add(avatar_id, &data.item_ref, data.quantity);
                }
                _ => {}
            }
        }

        state.position = state.position.advance();
        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        self.state.read().await.position
    }

    async fn reset(&self) -> Result<()> {
        *self.state.write().await = InventoryState::default();
        Ok(())
    }
}

impl ReadModel for AvatarInventoryView {
    fn name(&self) -> &'static str {
        "AvatarInventoryView"
    }

    fn count(&self) -> usize {
        self.state
            .try_read()
            .map(|s| s.inventories.len())
            .unwrap_or(0)
    }
}
