use super::{EntitySerDe, decode_entity};
use crate::core::{EntityType, Namespace, Result};
use crate::meta::Entity;
use crate::meta::entity::with_payload;

/// Plain JSON encoding, handy when the store needs to be inspected by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEntitySerDe;

impl EntitySerDe for JsonEntitySerDe {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, entity: &Entity) -> Result<Vec<u8>> {
        Ok(with_payload!(entity, p => serde_json::to_vec(p)?))
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        entity_type: EntityType,
        namespace: Namespace,
    ) -> Result<Entity> {
        let mut entity = decode_entity!(entity_type, serde_json::from_slice(bytes));
        entity.set_namespace(namespace);
        Ok(entity)
    }
}
