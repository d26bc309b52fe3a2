//! Entity key layout.
//!
//! ```text
//! ml/{metalake id}
//! ca/{metalake id}/{catalog id}
//! sc/{metalake id}/{catalog id}/{schema id}
//! ta/{metalake id}/{catalog id}/{schema id}/{table id}
//! us/{metalake id}/{user id}
//! ```
//!
//! Ids are 8-byte big-endian, so every child of one namespace lies in a
//! single contiguous key range ordered by id.

use crate::core::{DbError, EntityType, Result};
use crate::storage::name_mapping::{decode_id, encode_id};

const SEPARATOR: u8 = b'/';
const ID_LEN: usize = 8;

pub fn entity_key(entity_type: EntityType, namespace_ids: &[i64], id: i64) -> Vec<u8> {
    let mut key = namespace_prefix(entity_type, namespace_ids);
    key.extend_from_slice(&encode_id(id));
    key
}

/// Prefix shared by every `entity_type` key below `namespace_ids`.
///
/// `namespace_ids` may be shorter than the type's namespace depth, in
/// which case the prefix covers all matching keys under that ancestor.
pub fn namespace_prefix(entity_type: EntityType, namespace_ids: &[i64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + (namespace_ids.len() + 1) * (ID_LEN + 1));
    key.extend_from_slice(entity_type.short_name().as_bytes());
    for id in namespace_ids {
        key.push(SEPARATOR);
        key.extend_from_slice(&encode_id(*id));
    }
    key.push(SEPARATOR);
    key
}

/// Prefix covering every key of `entity_type`.
pub fn type_prefix(entity_type: EntityType) -> Vec<u8> {
    namespace_prefix(entity_type, &[])
}

/// Name mapping key of an entity: namespace ids and the leaf name joined
/// by `/`. A metalake maps by its bare name. Users, groups and roles tag
/// the leaf with their type so one name can serve all three.
pub fn mapping_name(entity_type: EntityType, namespace_ids: &[i64], name: &str) -> String {
    let mut out = namespace_ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join("/");
    if !out.is_empty() {
        out.push('/');
    }
    if matches!(
        entity_type,
        EntityType::User | EntityType::Group | EntityType::Role
    ) {
        out.push_str(entity_type.short_name());
        out.push(':');
    }
    out.push_str(name);
    out
}

/// Entity type addressed by each namespace level.
pub fn level_type(level: usize) -> Option<EntityType> {
    match level {
        0 => Some(EntityType::Metalake),
        1 => Some(EntityType::Catalog),
        2 => Some(EntityType::Schema),
        _ => None,
    }
}

/// Splits an entity key back into its type, namespace ids and leaf id.
pub fn decode_entity_key(key: &[u8]) -> Result<(EntityType, Vec<i64>, i64)> {
    let malformed = || DbError::Serialization(format!("malformed entity key {:?}", key));
    if key.len() < 2 {
        return Err(malformed());
    }
    let entity_type = EntityType::from_short_name(&key[..2]).ok_or_else(malformed)?;
    let rest = &key[2..];
    let segment = ID_LEN + 1;
    if rest.is_empty() || rest.len() % segment != 0 {
        return Err(malformed());
    }

    let mut ids = Vec::with_capacity(rest.len() / segment);
    for chunk in rest.chunks(segment) {
        if chunk[0] != SEPARATOR {
            return Err(malformed());
        }
        ids.push(decode_id(&chunk[1..])?);
    }
    if ids.len() != entity_type.namespace_depth() + 1 {
        return Err(malformed());
    }
    let id = ids.pop().ok_or_else(malformed)?;
    Ok((entity_type, ids, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::KvRangeScan;

    #[test]
    fn test_key_layout() {
        let key = entity_key(EntityType::Catalog, &[1], 2);
        let mut expected = b"ca/".to_vec();
        expected.extend_from_slice(&1i64.to_be_bytes());
        expected.push(b'/');
        expected.extend_from_slice(&2i64.to_be_bytes());
        assert_eq!(key, expected);
        assert_eq!(entity_key(EntityType::Metalake, &[], 7).len(), 2 + 1 + 8);
    }

    #[test]
    fn test_children_fall_in_parent_prefix() {
        let range = KvRangeScan::prefix(&namespace_prefix(EntityType::Table, &[1, 2, 3]));
        assert!(range.contains(&entity_key(EntityType::Table, &[1, 2, 3], 4)));
        assert!(!range.contains(&entity_key(EntityType::Table, &[1, 2, 5], 4)));
        assert!(!range.contains(&entity_key(EntityType::Topic, &[1, 2, 3], 4)));

        let catalog_wide = KvRangeScan::prefix(&namespace_prefix(EntityType::Table, &[1, 2]));
        assert!(catalog_wide.contains(&entity_key(EntityType::Table, &[1, 2, 5], 4)));
    }

    #[test]
    fn test_keys_sort_by_id() {
        let low = entity_key(EntityType::Schema, &[1, 2], 3);
        let high = entity_key(EntityType::Schema, &[1, 2], 300);
        assert!(low < high);
    }

    #[test]
    fn test_mapping_name() {
        assert_eq!(mapping_name(EntityType::Metalake, &[], "ml"), "ml");
        assert_eq!(mapping_name(EntityType::Schema, &[1, 2], "c"), "1/2/c");
        assert_eq!(mapping_name(EntityType::User, &[1], "admin"), "1/us:admin");
        assert_ne!(
            mapping_name(EntityType::User, &[1], "admin"),
            mapping_name(EntityType::Role, &[1], "admin")
        );
    }

    #[test]
    fn test_decode_entity_key() {
        let key = entity_key(EntityType::Fileset, &[1, 2, 3], 4);
        assert_eq!(
            decode_entity_key(&key).unwrap(),
            (EntityType::Fileset, vec![1, 2, 3], 4)
        );
        assert!(decode_entity_key(b"zz/").is_err());
        assert!(decode_entity_key(&entity_key(EntityType::Table, &[1], 2)).is_err());
    }
}
