//! Saga replay engine.
//!
//! This crate derives world state from the saga transaction log:
//! - `SagaStateMachine` folds committed transactions into a `SagaState`
//! - `SagaTemplate` and `TemplateCatalog` describe what a saga declares
//! - `SagaCommandHandler` runs the read, decide, append, commit cycle
//! - `SagaService` exposes gameplay intents on top of the handler

pub mod command;
pub mod commands;
pub mod error;
pub mod machine;
pub mod service;
pub mod state;
pub mod template;

pub use command::{CommandOutcome, Rejection, SagaCommandHandler};
pub use commands::{
    ActivateTrigger, CompleteSaga, CompleteTrigger, DamageCharacter, DiscoverSaga, HealCharacter,
    Presence, RecordPresence, RecordTransaction, SpawnCharacter,
};
pub use error::{CommandFailure, EngineError, FailureKind, ReplayError, Result};
pub use machine::SagaStateMachine;
pub use service::SagaService;
pub use state::{CharacterState, SagaState, SagaStatus, TriggerState, TriggerStatus};
pub use template::{ContentIndex, ContentRecord, SagaTemplate, TemplateCatalog};
