//! Identifier and content-reference types shared by every crate in the workspace.

mod refs;
mod types;

pub use refs::{CharacterRef, DialogueRef, ItemRef, QuestRef, SagaRef, TriggerRef};
pub use types::{AvatarId, CharacterInstanceId, InstanceId};
