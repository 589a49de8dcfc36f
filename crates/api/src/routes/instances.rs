//! Saga instance endpoints: the raw transaction log and the intent commands.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{AvatarId, SagaRef};
use saga_engine::{
    ActivateTrigger, CommandOutcome, CompleteSaga, CompleteTrigger, DamageCharacter,
    DiscoverSaga, HealCharacter, RecordPresence, RecordTransaction, SagaState, SpawnCharacter,
};
use saga_log::{
    CommitVersion, LoggedTransaction, SagaInstance, SagaRepository,
    SagaRepositoryExt, SagaTransaction, SequenceNumber, TransactionDraft, TransactionId,
    TransactionKind, TransactionPayload, TransactionQuery, TransactionStatus,
};
use serde::{Deserialize, Serialize};

use super::{
    parse_avatar_id, parse_character_id, parse_instance_id, parse_optional_avatar_id,
    parse_transaction_id, parse_transaction_ids,
};
use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct OpenInstanceRequest {
    pub saga_ref: String,
    /// Owner of a single-player instance. Omit for the shared instance.
    pub avatar_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TransactionRequest {
    /// Client-chosen id, so a retried append is recognised as a duplicate.
    pub transaction_id: Option<String>,
    pub avatar_id: Option<String>,
    pub local_timestamp: Option<DateTime<Utc>>,
    pub payload: TransactionPayload,
}

#[derive(Deserialize)]
pub struct AppendRequest {
    pub transactions: Vec<TransactionRequest>,
}

#[derive(Deserialize)]
pub struct CommitRequest {
    pub transaction_ids: Vec<String>,
    pub expected_commit_version: Option<u64>,
}

#[derive(Deserialize)]
pub struct RollbackRequest {
    pub transaction_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct StateQuery {
    pub sequence: Option<u64>,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct TransactionsQuery {
    pub kind: Option<String>,
    pub status: Option<String>,
    pub avatar_id: Option<String>,
    pub from_sequence: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct AvatarRequest {
    pub avatar_id: String,
}

#[derive(Deserialize, Default)]
pub struct ActorRequest {
    pub avatar_id: Option<String>,
}

#[derive(Deserialize)]
pub struct SpawnRequest {
    pub character_ref: String,
    pub character_instance_id: Option<String>,
    pub spawned_by_trigger_ref: Option<String>,
}

#[derive(Deserialize)]
pub struct HealthChangeRequest {
    pub avatar_id: Option<String>,
    pub fraction: f64,
}

#[derive(Deserialize, Clone, Copy)]
pub enum PresenceChange {
    Entered,
    Exited,
}

#[derive(Deserialize)]
pub struct PresenceRequest {
    pub avatar_id: String,
    pub presence: PresenceChange,
}

#[derive(Deserialize)]
pub struct RecordRequest {
    pub avatar_id: Option<String>,
    pub local_timestamp: Option<DateTime<Utc>>,
    pub payload: TransactionPayload,
}

// -- Response types --

#[derive(Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub saga_ref: SagaRef,
    pub instance_type: &'static str,
    pub owner_avatar_id: Option<AvatarId>,
    pub created_at: DateTime<Utc>,
    pub commit_version: CommitVersion,
    pub next_sequence_number: SequenceNumber,
}

impl From<&SagaInstance> for InstanceSummary {
    fn from(instance: &SagaInstance) -> Self {
        Self {
            instance_id: instance.instance_id().to_string(),
            saga_ref: instance.saga_ref().clone(),
            instance_type: instance.instance_type().as_str(),
            owner_avatar_id: instance.owner_avatar_id(),
            created_at: instance.created_at(),
            commit_version: instance.commit_version(),
            next_sequence_number: instance.next_sequence_number(),
        }
    }
}

#[derive(Serialize)]
pub struct InstanceResponse {
    #[serde(flatten)]
    pub summary: InstanceSummary,
    pub transactions: Vec<SagaTransaction>,
}

#[derive(Serialize)]
pub struct AppendResponse {
    pub transaction_ids: Vec<TransactionId>,
    pub sequence_numbers: Vec<SequenceNumber>,
}

#[derive(Serialize)]
pub struct CommitResponse {
    pub committed: bool,
    pub commit_version: CommitVersion,
}

#[derive(Serialize)]
pub struct CommandResponse {
    pub instance_id: String,
    pub transaction_ids: Vec<TransactionId>,
    pub sequence_numbers: Vec<SequenceNumber>,
    pub attempts: u32,
    pub state: SagaState,
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            instance_id: outcome.instance_id.to_string(),
            transaction_ids: outcome.transaction_ids,
            sequence_numbers: outcome.sequence_numbers,
            attempts: outcome.attempts,
            state: outcome.state,
        }
    }
}

/// Status for a command: 201 when it committed something, 200 for a no-op.
fn command_reply(outcome: CommandOutcome) -> (StatusCode, Json<CommandResponse>) {
    let status = if outcome.is_noop() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(outcome.into()))
}

// -- Log handlers --

/// POST /instances: open a single-player or the shared instance of a saga.
#[tracing::instrument(skip(state, req))]
pub async fn open<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Json(req): Json<OpenInstanceRequest>,
) -> Result<Json<InstanceSummary>, ApiError> {
    let saga_ref = SagaRef::new(req.saga_ref);
    let instance = match parse_optional_avatar_id(req.avatar_id.as_deref())? {
        Some(avatar_id) => state.saga_service.open_instance(avatar_id, saga_ref).await?,
        None => state.saga_service.open_shared_instance(saga_ref).await?,
    };
    Ok(Json(InstanceSummary::from(&instance)))
}

/// GET /instances/:id: the instance and its whole log, every status included.
#[tracing::instrument(skip(state))]
pub async fn get<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
) -> Result<Json<InstanceResponse>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let instance = state
        .repository()
        .get_instance_by_id(instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga instance {id} not found")))?;

    Ok(Json(InstanceResponse {
        summary: InstanceSummary::from(&instance),
        transactions: instance.transactions().to_vec(),
    }))
}

/// GET /instances/:id/transactions: filtered view of an instance log.
#[tracing::instrument(skip(state, params))]
pub async fn transactions<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Query(params): Query<TransactionsQuery>,
) -> Result<Json<Vec<LoggedTransaction>>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    state.repository().require_instance(instance_id).await?;

    let mut query = TransactionQuery::for_instance(instance_id);
    if let Some(kind) = params.kind.as_deref() {
        query = query.kind(kind.parse::<TransactionKind>()?);
    }
    if let Some(status) = params.status.as_deref() {
        let status = TransactionStatus::parse(status)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown transaction status: {status}")))?;
        query = query.status(status);
    }
    if let Some(avatar_id) = params.avatar_id.as_deref() {
        query = query.avatar_id(parse_avatar_id(avatar_id)?);
    }
    if let Some(sequence) = params.from_sequence {
        query = query.from_sequence(SequenceNumber::new(sequence));
    }
    if let Some(limit) = params.limit {
        query = query.limit(limit);
    }

    Ok(Json(state.repository().query_transactions(query).await?))
}

/// POST /instances/:id/transactions: append pending transactions.
#[tracing::instrument(skip(state, req))]
pub async fn append<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<AppendRequest>,
) -> Result<(StatusCode, Json<AppendResponse>), ApiError> {
    let instance_id = parse_instance_id(&id)?;

    let mut drafts = Vec::with_capacity(req.transactions.len());
    for tx in req.transactions {
        let mut draft = TransactionDraft::new(tx.payload);
        if let Some(transaction_id) = tx.transaction_id.as_deref() {
            draft = draft.transaction_id(parse_transaction_id(transaction_id)?);
        }
        if let Some(avatar_id) = parse_optional_avatar_id(tx.avatar_id.as_deref())? {
            draft = draft.avatar(avatar_id);
        }
        if let Some(local_timestamp) = tx.local_timestamp {
            draft = draft.local_timestamp(local_timestamp);
        }
        drafts.push(draft);
    }

    let transaction_ids: Vec<_> = drafts.iter().map(|d| d.transaction_id).collect();
    let sequence_numbers = state
        .repository()
        .add_transactions(instance_id, drafts)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AppendResponse {
            transaction_ids,
            sequence_numbers,
        }),
    ))
}

/// POST /instances/:id/commit: commit pending transactions.
///
/// A batch the saga could not replay answers 422. A lost race answers 409
/// with `committed: false`; the batch stays pending.
#[tracing::instrument(skip(state, req))]
pub async fn commit<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<CommitRequest>,
) -> Result<(StatusCode, Json<CommitResponse>), ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let transaction_ids = parse_transaction_ids(&req.transaction_ids)?;

    let committed = state
        .saga_service
        .commit_checked(
            instance_id,
            &transaction_ids,
            req.expected_commit_version.map(CommitVersion::new),
        )
        .await?;
    let instance = state.repository().require_instance(instance_id).await?;

    let status = if committed {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((
        status,
        Json(CommitResponse {
            committed,
            commit_version: instance.commit_version(),
        }),
    ))
}

/// POST /instances/:id/rollback: roll back pending transactions.
#[tracing::instrument(skip(state, req))]
pub async fn rollback<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> Result<StatusCode, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let transaction_ids = parse_transaction_ids(&req.transaction_ids)?;
    state
        .repository()
        .rollback_transactions(instance_id, &transaction_ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /instances/:id/state: replayed state, now or as of `?sequence=` / `?at=`.
#[tracing::instrument(skip(state, params))]
pub async fn state<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Query(params): Query<StateQuery>,
) -> Result<Json<SagaState>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let service = &state.saga_service;

    let saga_state = match (params.sequence, params.at) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "Pass either sequence or at, not both".to_string(),
            ));
        }
        (Some(sequence), None) => {
            service
                .state_at_sequence(instance_id, SequenceNumber::new(sequence))
                .await?
        }
        (None, Some(at)) => service.state_at_time(instance_id, at).await?,
        (None, None) => service.current_state(instance_id).await?,
    };
    Ok(Json(saga_state))
}

// -- Intent handlers --

/// POST /instances/:id/discover
#[tracing::instrument(skip(state, req))]
pub async fn discover<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<AvatarRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let cmd = DiscoverSaga::new(parse_instance_id(&id)?, parse_avatar_id(&req.avatar_id)?);
    Ok(command_reply(state.saga_service.discover_saga(cmd).await?))
}

/// POST /instances/:id/complete
#[tracing::instrument(skip(state, req))]
pub async fn complete<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<AvatarRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let cmd = CompleteSaga::new(parse_instance_id(&id)?, parse_avatar_id(&req.avatar_id)?);
    Ok(command_reply(state.saga_service.complete_saga(cmd).await?))
}

/// POST /instances/:id/triggers/:trigger_ref/activate
#[tracing::instrument(skip(state, req))]
pub async fn activate_trigger<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path((id, trigger_ref)): Path<(String, String)>,
    Json(req): Json<ActorRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let cmd = ActivateTrigger::new(
        parse_instance_id(&id)?,
        parse_optional_avatar_id(req.avatar_id.as_deref())?,
        trigger_ref,
    );
    Ok(command_reply(state.saga_service.activate_trigger(cmd).await?))
}

/// POST /instances/:id/triggers/:trigger_ref/complete
#[tracing::instrument(skip(state, req))]
pub async fn complete_trigger<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path((id, trigger_ref)): Path<(String, String)>,
    Json(req): Json<ActorRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let cmd = CompleteTrigger::new(
        parse_instance_id(&id)?,
        parse_optional_avatar_id(req.avatar_id.as_deref())?,
        trigger_ref,
    );
    Ok(command_reply(state.saga_service.complete_trigger(cmd).await?))
}

/// POST /instances/:id/characters: spawn a character.
#[tracing::instrument(skip(state, req))]
pub async fn spawn<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<SpawnRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let mut cmd = SpawnCharacter::new(parse_instance_id(&id)?, req.character_ref);
    if let Some(character_id) = req.character_instance_id.as_deref() {
        cmd = cmd.with_id(parse_character_id(character_id)?);
    }
    if let Some(trigger_ref) = req.spawned_by_trigger_ref {
        cmd = cmd.from_trigger(trigger_ref);
    }
    Ok(command_reply(state.saga_service.spawn_character(cmd).await?))
}

/// POST /instances/:id/characters/:character_id/damage
#[tracing::instrument(skip(state, req))]
pub async fn damage<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path((id, character_id)): Path<(String, String)>,
    Json(req): Json<HealthChangeRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let cmd = DamageCharacter::new(
        parse_instance_id(&id)?,
        parse_optional_avatar_id(req.avatar_id.as_deref())?,
        parse_character_id(&character_id)?,
        req.fraction,
    );
    Ok(command_reply(state.saga_service.damage_character(cmd).await?))
}

/// POST /instances/:id/characters/:character_id/heal
#[tracing::instrument(skip(state, req))]
pub async fn heal<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path((id, character_id)): Path<(String, String)>,
    Json(req): Json<HealthChangeRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let cmd = HealCharacter::new(
        parse_instance_id(&id)?,
        parse_optional_avatar_id(req.avatar_id.as_deref())?,
        parse_character_id(&character_id)?,
        req.fraction,
    );
    Ok(command_reply(state.saga_service.heal_character(cmd).await?))
}

/// POST /instances/:id/presence
#[tracing::instrument(skip(state, req))]
pub async fn presence<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<PresenceRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let avatar_id = parse_avatar_id(&req.avatar_id)?;
    let cmd = match req.presence {
        PresenceChange::Entered => RecordPresence::entered(instance_id, avatar_id),
        PresenceChange::Exited => RecordPresence::exited(instance_id, avatar_id),
    };
    Ok(command_reply(state.saga_service.record_presence(cmd).await?))
}

/// POST /instances/:id/record: log a transaction with no world-state effect.
#[tracing::instrument(skip(state, req))]
pub async fn record<R: SagaRepository + Clone + 'static>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<String>,
    Json(req): Json<RecordRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let mut cmd = RecordTransaction::new(
        parse_instance_id(&id)?,
        parse_optional_avatar_id(req.avatar_id.as_deref())?,
        req.payload,
    );
    if let Some(local_timestamp) = req.local_timestamp {
        cmd = cmd.at_local_time(local_timestamp);
    }
    Ok(command_reply(state.saga_service.record_transaction(cmd).await?))
}
