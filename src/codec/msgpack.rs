use super::{EntitySerDe, decode_entity};
use crate::core::{EntityType, Namespace, Result};
use crate::meta::Entity;
use crate::meta::entity::with_payload;

/// Compact binary encoding. Fields are written by name so payloads stay
/// readable after fields are added or reordered.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackEntitySerDe;

impl EntitySerDe for MsgPackEntitySerDe {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize(&self, entity: &Entity) -> Result<Vec<u8>> {
        Ok(with_payload!(entity, p => rmp_serde::to_vec_named(p)?))
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        entity_type: EntityType,
        namespace: Namespace,
    ) -> Result<Entity> {
        let mut entity = decode_entity!(entity_type, rmp_serde::from_slice(bytes));
        entity.set_namespace(namespace);
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{AuditInfo, TableEntity};
    use serde::Serialize;

    // Table payload as written before `properties` and `columns` existed.
    #[derive(Serialize)]
    struct LegacyTable {
        id: i64,
        name: String,
        comment: Option<String>,
        audit_info: AuditInfo,
    }

    #[test]
    fn test_old_payload_decodes_with_defaults() {
        let audit = AuditInfo::created_by("legacy");
        let bytes = rmp_serde::to_vec_named(&LegacyTable {
            id: 11,
            name: "orders".to_string(),
            comment: None,
            audit_info: audit.clone(),
        })
        .unwrap();

        let namespace = Namespace::of(["ml", "hive", "db"]);
        let entity = MsgPackEntitySerDe
            .deserialize(&bytes, EntityType::Table, namespace.clone())
            .unwrap();
        let expected = TableEntity::new(11, namespace, "orders", audit).unwrap();
        assert_eq!(entity, Entity::Table(expected));
    }

    #[test]
    fn test_absent_optionals_are_not_written() {
        let entity = &super::super::tests::sample_entities()[1];
        let bytes = MsgPackEntitySerDe.serialize(entity).unwrap();
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        let fields = value.as_object().unwrap();
        assert!(!fields.contains_key("comment"));
        assert!(!fields.contains_key("properties"));
        assert!(fields.contains_key("schema_version"));
    }
}
