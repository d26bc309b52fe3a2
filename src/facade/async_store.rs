use crate::core::{DbError, EntityType, NameIdentifier, Namespace, Result};
use crate::meta::{Entity, UserEntity};
use crate::store::{DeletedEntity, EntityStore, KvEntityStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Async front of [`KvEntityStore`] for callers running on tokio.
///
/// Every call runs on the blocking pool, since backend calls may wait on
/// locks and disk.
///
/// ```
/// use rustmetadb::meta::MetalakeEntity;
/// use rustmetadb::{AuditInfo, EntityType, MetaStore, NameIdentifier};
///
/// # tokio_test::block_on(async {
/// let meta = MetaStore::in_memory().unwrap();
/// let store = meta.async_store();
/// let lake = MetalakeEntity::new(1, "lake", AuditInfo::created_by("admin")).unwrap();
/// store.put(lake.into(), false).await.unwrap();
///
/// let ident = NameIdentifier::parse("lake").unwrap();
/// assert!(store.exists(ident, EntityType::Metalake).await.unwrap());
/// # });
/// ```
#[derive(Clone)]
pub struct AsyncEntityStore {
    store: Arc<KvEntityStore>,
}

impl AsyncEntityStore {
    pub fn new(store: Arc<KvEntityStore>) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &Arc<KvEntityStore> {
        &self.store
    }

    async fn run<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&KvEntityStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| DbError::Backend(format!("blocking store task failed: {}", e)))?
    }

    pub async fn list(&self, namespace: Namespace, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.run(move |store| store.list(&namespace, entity_type)).await
    }

    pub async fn exists(&self, ident: NameIdentifier, entity_type: EntityType) -> Result<bool> {
        self.run(move |store| store.exists(&ident, entity_type)).await
    }

    pub async fn get(&self, ident: NameIdentifier, entity_type: EntityType) -> Result<Entity> {
        self.run(move |store| store.get(&ident, entity_type)).await
    }

    pub async fn put(&self, entity: Entity, overwrite: bool) -> Result<()> {
        self.run(move |store| store.put(&entity, overwrite)).await
    }

    pub async fn update<F>(
        &self,
        ident: NameIdentifier,
        entity_type: EntityType,
        updater: F,
    ) -> Result<Entity>
    where
        F: FnOnce(Entity) -> Result<Entity> + Send + 'static,
    {
        self.run(move |store| store.update(&ident, entity_type, updater))
            .await
    }

    pub async fn delete(
        &self,
        ident: NameIdentifier,
        entity_type: EntityType,
        cascade: bool,
    ) -> Result<bool> {
        self.run(move |store| store.delete(&ident, entity_type, cascade))
            .await
    }

    pub async fn list_deleted_before(
        &self,
        entity_type: EntityType,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeletedEntity>> {
        self.run(move |store| store.list_deleted_before(entity_type, cutoff))
            .await
    }

    pub async fn purge_deleted_before(
        &self,
        entity_type: EntityType,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        self.run(move |store| store.purge_deleted_before(entity_type, cutoff))
            .await
    }

    pub async fn list_users_by_role(&self, metalake: String, role: String) -> Result<Vec<UserEntity>> {
        self.run(move |store| store.list_users_by_role(&metalake, &role))
            .await
    }
}
