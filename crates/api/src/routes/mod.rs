pub mod avatars;
pub mod health;
pub mod instances;
pub mod metrics;

use common::{AvatarId, CharacterInstanceId, InstanceId};
use saga_log::TransactionId;
use uuid::Uuid;

use crate::error::ApiError;

fn parse_uuid(what: &str, id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|e| ApiError::BadRequest(format!("Invalid {what}: {e}")))
}

pub(crate) fn parse_instance_id(id: &str) -> Result<InstanceId, ApiError> {
    parse_uuid("instance id", id).map(InstanceId::from_uuid)
}

pub(crate) fn parse_avatar_id(id: &str) -> Result<AvatarId, ApiError> {
    parse_uuid("avatar id", id).map(AvatarId::from_uuid)
}

pub(crate) fn parse_optional_avatar_id(id: Option<&str>) -> Result<Option<AvatarId>, ApiError> {
    id.map(parse_avatar_id).transpose()
}

pub(crate) fn parse_character_id(id: &str) -> Result<CharacterInstanceId, ApiError> {
    parse_uuid("character instance id", id).map(CharacterInstanceId::from_uuid)
}

pub(crate) fn parse_transaction_id(id: &str) -> Result<TransactionId, ApiError> {
    parse_uuid("transaction id", id).map(TransactionId::from_uuid)
}

pub(crate) fn parse_transaction_ids(ids: &[String]) -> Result<Vec<TransactionId>, ApiError> {
    ids.iter().map(|id| parse_transaction_id(id)).collect()
}
