// ============================================================================
// RustMetaDB Library
// ============================================================================
//
// Embedded metadata store for catalog entities (metalakes, catalogs,
// schemas, tables, filesets, topics, users, groups, roles):
//
//   MetaStore ─> KvEntityStore ─> KvNameMappingService ─> TransactionCoordinator
//                     │                                          │
//                     └──> EntitySerDe                           └──> KvBackend (MVCC + WAL)
//
// ============================================================================

pub mod codec;
pub mod config;
pub mod core;
pub mod facade;
pub mod meta;
pub mod storage;
pub mod store;
pub mod transaction;

pub use codec::{EntitySerDe, create_serde};
pub use config::{IdGeneratorKind, StoreConfig};
pub use crate::core::{DbError, EntityType, NameIdentifier, Namespace, Result};
pub use facade::{AsyncEntityStore, MetaStore};
pub use meta::{AuditInfo, Entity};
pub use storage::{
    DurabilityMode, IdGenerator, KvBackend, KvNameMappingService, MvccKvBackend,
    NameMappingService,
};
pub use store::{DeletedEntity, EntityStore, KvEntityStore, StoreSession};
pub use transaction::{RetryPolicy, TransactionCoordinator, TxnScope};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{CatalogEntity, CatalogType, MetalakeEntity};

    #[test]
    fn test_quick_start() {
        let meta = MetaStore::in_memory().unwrap();
        let store = meta.store();

        store
            .put(
                &MetalakeEntity::new(1, "lake", AuditInfo::created_by("admin"))
                    .unwrap()
                    .into(),
                false,
            )
            .unwrap();
        store
            .put(
                &CatalogEntity::new(
                    2,
                    Namespace::of(["lake"]),
                    "hive",
                    CatalogType::Relational,
                    "hive",
                    AuditInfo::created_by("admin"),
                )
                .unwrap()
                .into(),
                false,
            )
            .unwrap();

        let catalogs = store.list(&Namespace::of(["lake"]), EntityType::Catalog).unwrap();
        assert_eq!(catalogs.len(), 1);
        assert_eq!(catalogs[0].name(), "hive");
    }
}
