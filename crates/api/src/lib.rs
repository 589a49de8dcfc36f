//! HTTP API server with observability for the saga transaction log.
//!
//! Exposes the raw log (append, commit, rollback, point-in-time state) next
//! to the intent commands of the saga engine and the avatar read models,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use projections::{AchievementView, AvatarInventoryView, Projection, ProjectionProcessor};
use saga_engine::{SagaCommandHandler, SagaService, TemplateCatalog};
use saga_log::SagaRepository;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<R: SagaRepository> {
    pub saga_service: SagaService<R>,
    pub projection_processor: Arc<ProjectionProcessor<R>>,
    pub inventory: AvatarInventoryView,
    pub achievements: AchievementView,
}

impl<R: SagaRepository + Clone + 'static> AppState<R> {
    /// Returns the transaction log behind the service.
    pub fn repository(&self) -> &R {
        self.saga_service.repository()
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<R: SagaRepository + Clone + 'static>(
    state: Arc<AppState<R>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    use routes::{avatars, instances};

    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/instances", post(instances::open::<R>))
        .route("/instances/{id}", get(instances::get::<R>))
        .route(
            "/instances/{id}/transactions",
            get(instances::transactions::<R>).post(instances::append::<R>),
        )
        .route("/instances/{id}/commit", post(instances::commit::<R>))
        .route("/instances/{id}/rollback", post(instances::rollback::<R>))
        .route("/instances/{id}/state", get(instances::state::<R>))
        .route("/instances/{id}/discover", post(instances::discover::<R>))
        .route("/instances/{id}/complete", post(instances::complete::<R>))
        .route(
            "/instances/{id}/triggers/{trigger_ref}/activate",
            post(instances::activate_trigger::<R>),
        )
        .route(
            "/instances/{id}/triggers/{trigger_ref}/complete",
            post(instances::complete_trigger::<R>),
        )
        .route("/instances/{id}/characters", post(instances::spawn::<R>))
        .route(
            "/instances/{id}/characters/{character_id}/damage",
            post(instances::damage::<R>),
        )
        .route(
            "/instances/{id}/characters/{character_id}/heal",
            post(instances::heal::<R>),
        )
        .route("/instances/{id}/presence", post(instances::presence::<R>))
        .route("/instances/{id}/record", post(instances::record::<R>))
        .route("/avatars/{id}/instances", get(avatars::instances::<R>))
        .route("/avatars/{id}/inventory", get(avatars::inventory::<R>))
        .route("/avatars/{id}/achievements", get(avatars::achievements::<R>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state over a repository, wiring the read models
/// into a projection processor.
pub fn create_default_state<R: SagaRepository + Clone + 'static>(
    repository: R,
    catalog: Arc<TemplateCatalog>,
    max_commit_attempts: u32,
) -> (Arc<AppState<R>>, Arc<ProjectionProcessor<R>>) {
    let handler = SagaCommandHandler::new(repository.clone(), catalog)
        .with_max_commit_attempts(max_commit_attempts);
    let saga_service = SagaService::from_handler(handler);

    let inventory = AvatarInventoryView::new();
    let achievements = AchievementView::new();

    let mut processor = ProjectionProcessor::new(repository);
    processor.register(Box::new(inventory.clone()) as Box<dyn Projection>);
    processor.register(Box::new(achievements.clone()) as Box<dyn Projection>);
    let processor = Arc::new(processor);

    let state = Arc::new(AppState {
        saga_service,
        projection_processor: processor.clone(),
        inventory,
        achievements,
    });

    (state, processor)
}
