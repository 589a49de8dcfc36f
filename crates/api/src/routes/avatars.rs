//! Per-avatar endpoints backed by the log and the read models.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{AvatarId, ItemRef};
use projections::AvatarAchievements;
use saga_log::SagaRepository;
use serde::Serialize;

use super::instances::InstanceSummary;
use super::parse_avatar_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct InventoryResponse {
    pub avatar_id: AvatarId,
    pub items: BTreeMap<ItemRef, u64>,
}

#[derive(Serialize)]
pub struct AchievementsResponse {
    pub avatar_id: AvatarId,
    #[serde(flatten)]
    pub achievements: AvatarAchievements,
}

/// Brings the read models up to date with the commits since the last catch-up.
async fn catch_up<R: SagaRepository>(state: &AppState<R>) -> Result<(), ApiError> {
    let delivered = state.projection_processor.run_catch_up().await?;
    metrics::histogram!("projections_catch_up_transactions").record(delivered as f64);
    Ok(())
}

/// GET /avatars/:id/instances: owned instances and shared ones the avatar wrote to.
#[tracing::instrument(skip(state))]
pub async fn instances<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<InstanceSummary>>, ApiError> {
    let avatar_id = parse_avatar_id(&id)?;
    let instances = state
        .repository()
        .get_all_instances_for_avatar(avatar_id)
        .await?;
    Ok(Json(instances.iter().map(InstanceSummary::from).collect()))
}

/// GET /avatars/:id/inventory: item counts from the inventory read model.
#[tracing::instrument(skip(state))]
pub async fn inventory<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<Json<InventoryResponse>, ApiError> {
    let avatar_id = parse_avatar_id(&id)?;

    catch_up(&state).await?;

    Ok(Json(InventoryResponse {
        avatar_id,
        items: state.inventory.get_inventory(avatar_id).await,
    }))
}

/// GET /avatars/:id/achievements: progress and defeat credits.
#[tracing::instrument(skip(state))]
pub async fn achievements<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<Json<AchievementsResponse>, ApiError> {
    let avatar_id = parse_avatar_id(&id)?;

    catch_up(&state).await?;

    let achievements = state
        .achievements
        .get_achievements(avatar_id)
        .await
        .unwrap_or_default();
    Ok(Json(AchievementsResponse {
        avatar_id,
        achievements,
    }))
}
