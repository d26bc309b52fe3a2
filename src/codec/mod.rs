//! Entity payload encodings.
//!
//! Only the payload is encoded. The entity type comes from the key prefix
//! and the namespace from the lookup path, so both are passed back in on
//! decode.

pub mod json;
pub mod msgpack;

pub use json::JsonEntitySerDe;
pub use msgpack::MsgPackEntitySerDe;

use crate::core::{DbError, EntityType, Namespace, Result};
use crate::meta::Entity;
use std::sync::Arc;

pub trait EntitySerDe: Send + Sync {
    fn name(&self) -> &'static str;

    fn serialize(&self, entity: &Entity) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8], entity_type: EntityType, namespace: Namespace)
    -> Result<Entity>;
}

/// Builds the payload for `$entity_type` by running `$decode` with the
/// concrete payload type inferred per arm.
macro_rules! decode_entity {
    ($entity_type:expr, $decode:expr) => {
        match $entity_type {
            EntityType::Metalake => Entity::Metalake($decode?),
            EntityType::Catalog => Entity::Catalog($decode?),
            EntityType::Schema => Entity::Schema($decode?),
            EntityType::Table => Entity::Table($decode?),
            EntityType::Fileset => Entity::Fileset($decode?),
            EntityType::Topic => Entity::Topic($decode?),
            EntityType::User => Entity::User($decode?),
            EntityType::Group => Entity::Group($decode?),
            EntityType::Role => Entity::Role($decode?),
        }
    };
}

pub(crate) use decode_entity;

/// Creates the encoding registered under `kind`.
///
/// `proto` is accepted as an alias of the compact binary encoding.
pub fn create_serde(kind: &str) -> Result<Arc<dyn EntitySerDe>> {
    match kind.to_ascii_lowercase().as_str() {
        "msgpack" | "proto" => Ok(Arc::new(MsgPackEntitySerDe)),
        "json" => Ok(Arc::new(JsonEntitySerDe)),
        other => Err(DbError::Config(format!("unknown entity serde '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::*;

    fn audit() -> AuditInfo {
        AuditInfo::created_by("creator")
    }

    pub(super) fn sample_entities() -> Vec<Entity> {
        let mut props = Properties::new();
        props.insert("k1".to_string(), "v1".to_string());
        vec![
            MetalakeEntity::new(1, "ml", audit())
                .unwrap()
                .with_comment("lake")
                .with_properties(props.clone())
                .into(),
            MetalakeEntity::new(2, "bare", audit()).unwrap().into(),
            CatalogEntity::new(
                3,
                Namespace::of(["ml"]),
                "hive",
                CatalogType::Relational,
                "hive",
                audit(),
            )
            .unwrap()
            .into(),
            SchemaEntity::new(4, Namespace::of(["ml", "hive"]), "db", audit())
                .unwrap()
                .into(),
            TableEntity::new(5, Namespace::of(["ml", "hive", "db"]), "t", audit())
                .unwrap()
                .with_columns(vec![
                    ColumnEntity::new("id", "bigint").not_null(),
                    ColumnEntity::new("name", "string").with_comment("display name"),
                ])
                .into(),
            FilesetEntity::new(
                6,
                Namespace::of(["ml", "fs", "db"]),
                "files",
                FilesetType::External,
                "s3://bucket/path",
                audit(),
            )
            .unwrap()
            .with_properties(props.clone())
            .into(),
            TopicEntity::new(7, Namespace::of(["ml", "kafka", "default"]), "events", audit())
                .unwrap()
                .into(),
            UserEntity::new(8, Namespace::of(["ml"]), "alice", audit())
                .unwrap()
                .with_roles(vec!["admin".to_string()])
                .into(),
            GroupEntity::new(9, Namespace::of(["ml"]), "eng", audit())
                .unwrap()
                .into(),
            RoleEntity::new(10, Namespace::of(["ml"]), "admin", "ml.hive", audit())
                .unwrap()
                .with_privileges(vec!["USE_CATALOG".to_string()])
                .into(),
        ]
    }

    #[test]
    fn test_every_serde_restores_every_variant() {
        for kind in ["msgpack", "json"] {
            let serde = create_serde(kind).unwrap();
            for entity in sample_entities() {
                let bytes = serde.serialize(&entity).unwrap();
                let decoded = serde
                    .deserialize(&bytes, entity.entity_type(), entity.namespace().clone())
                    .unwrap();
                assert_eq!(decoded, entity, "{} via {}", entity.name(), kind);
            }
        }
    }

    #[test]
    fn test_factory_names_and_aliases() {
        assert_eq!(create_serde("proto").unwrap().name(), "msgpack");
        assert_eq!(create_serde("JSON").unwrap().name(), "json");
        assert!(matches!(create_serde("avro"), Err(DbError::Config(_))));
    }

    #[test]
    fn test_wrong_type_tag_fails_cleanly() {
        let serde = create_serde("msgpack").unwrap();
        let entity = &sample_entities()[0];
        let bytes = serde.serialize(entity).unwrap();
        let err = serde
            .deserialize(&bytes, EntityType::Fileset, Namespace::of(["a", "b", "c"]))
            .unwrap_err();
        assert!(matches!(err, DbError::Serialization(_)));
    }
}
