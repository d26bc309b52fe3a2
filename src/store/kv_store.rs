// ============================================================================
// Key-Value Entity Store
// ============================================================================
//
// Entities are addressed by the ids of their ancestors, never by names:
// resolving `ml.cat.db.t` walks the name mapping one level at a time
// (`ml` -> 1, `1/cat` -> 2, `1/2/db` -> 3, `1/2/3/t` -> 4) and then reads
// `ta/1/2/3/4`. Renaming an entity only touches its own mapping.
//
// Deleting keeps the record under its key with `deleted_at` set and
// releases the name mapping, so the name can be taken again at once while
// the old record waits for the sweeper.
//
// Creating a child guards its parent's record and deleting guards every
// child range it inspects, so a create racing a delete of its parent
// always loses one side with `WriteConflict`.
//
// ============================================================================

use super::key_encoder::{
    decode_entity_key, entity_key, level_type, mapping_name, namespace_prefix, type_prefix,
};
use super::record::StoredRecord;
use crate::codec::EntitySerDe;
use crate::core::{DbError, EntityType, NameIdentifier, Namespace, Result};
use crate::meta::{Entity, UserEntity};
use crate::storage::kv::KvRangeScan;
use crate::storage::name_mapping::{KvNameMappingService, MappingSession};
use crate::transaction::{TransactionCoordinator, TxnScope};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

pub trait EntityStore: Send + Sync {
    /// Live entities of `entity_type` directly under `namespace`, by id.
    fn list(&self, namespace: &Namespace, entity_type: EntityType) -> Result<Vec<Entity>>;

    fn exists(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool>;

    fn get(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<Entity>;

    fn put(&self, entity: &Entity, overwrite: bool) -> Result<()>;

    /// Optimistic read-modify-write. Fails with `ConcurrentModification`
    /// when the record changed between the read and the write.
    fn update_entity(
        &self,
        ident: &NameIdentifier,
        entity_type: EntityType,
        updater: Box<dyn FnOnce(Entity) -> Result<Entity> + '_>,
    ) -> Result<Entity>;

    fn update<F>(&self, ident: &NameIdentifier, entity_type: EntityType, updater: F) -> Result<Entity>
    where
        F: FnOnce(Entity) -> Result<Entity>,
        Self: Sized,
    {
        self.update_entity(ident, entity_type, Box::new(updater))
    }

    fn delete(&self, ident: &NameIdentifier, entity_type: EntityType, cascade: bool)
    -> Result<bool>;

    fn close(&self) -> Result<()>;
}

/// A soft-deleted record waiting to be purged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedEntity {
    pub entity_type: EntityType,
    pub id: i64,
    pub name: String,
    /// Ids of the ancestors the entity lived under.
    pub namespace_ids: Vec<i64>,
    pub deleted_at: DateTime<Utc>,
    pub version: u64,
}

pub struct KvEntityStore {
    coordinator: TransactionCoordinator,
    mapping: Arc<KvNameMappingService>,
    serde: Arc<dyn EntitySerDe>,
}

impl KvEntityStore {
    pub fn new(
        coordinator: TransactionCoordinator,
        mapping: Arc<KvNameMappingService>,
        serde: Arc<dyn EntitySerDe>,
    ) -> Self {
        Self {
            coordinator,
            mapping,
            serde,
        }
    }

    pub fn serde(&self) -> &Arc<dyn EntitySerDe> {
        &self.serde
    }

    pub fn mapping(&self) -> &Arc<KvNameMappingService> {
        &self.mapping
    }

    pub fn session<'s, 'a>(&'s self, scope: &'s mut TxnScope<'a>) -> StoreSession<'s, 'a> {
        StoreSession { store: self, scope }
    }

    /// Runs several store operations atomically. Any error rolls all of
    /// them back and is returned unchanged.
    pub fn execute_in_transaction<R, E, F>(&self, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut StoreSession<'_, '_>) -> std::result::Result<R, E>,
        E: From<DbError>,
    {
        self.coordinator.execute_in_transaction(|scope| {
            let mut session = self.session(scope);
            work(&mut session)
        })
    }

    /// Soft-deleted records of `entity_type` deleted before `cutoff`.
    pub fn list_deleted_before(
        &self,
        entity_type: EntityType,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeletedEntity>> {
        self.execute_in_transaction(|session| session.list_deleted_before(entity_type, cutoff))
    }

    /// Physically removes what [`list_deleted_before`](Self::list_deleted_before)
    /// reports.
    pub fn purge_deleted_before(&self, entity_type: EntityType, cutoff: DateTime<Utc>) -> Result<usize> {
        let purged =
            self.execute_in_transaction(|session| session.purge_deleted_before(entity_type, cutoff))?;
        if purged > 0 {
            info!(entity_type = %entity_type, purged, %cutoff, "Purged soft-deleted entities");
        }
        Ok(purged)
    }

    pub fn list_users_by_role(&self, metalake: &str, role: &str) -> Result<Vec<UserEntity>> {
        self.execute_in_transaction(|session| session.list_users_by_role(metalake, role))
    }
}

impl EntityStore for KvEntityStore {
    fn list(&self, namespace: &Namespace, entity_type: EntityType) -> Result<Vec<Entity>> {
        self.execute_in_transaction(|session| session.list(namespace, entity_type))
    }

    fn exists(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool> {
        self.execute_in_transaction(|session| session.exists(ident, entity_type))
    }

    fn get(&self, ident: &NameIdentifier, entity_type: EntityType) -> Result<Entity> {
        self.execute_in_transaction(|session| session.get(ident, entity_type))
    }

    fn put(&self, entity: &Entity, overwrite: bool) -> Result<()> {
        self.execute_in_transaction(|session| session.put(entity, overwrite))
    }

    fn update_entity(
        &self,
        ident: &NameIdentifier,
        entity_type: EntityType,
        updater: Box<dyn FnOnce(Entity) -> Result<Entity> + '_>,
    ) -> Result<Entity> {
        let (located, current) = self.execute_in_transaction(|session| {
            let located = session.locate(ident, entity_type)?.ok_or_else(|| not_found(entity_type, ident))?;
            let current = session.decode(&located, ident.namespace().clone(), entity_type)?;
            Ok::<_, DbError>((located, current))
        })?;

        let updated = updater(current.clone())?;
        check_update(&current, &updated)?;

        let outcome = self.execute_in_transaction(|session| {
            session.write_update(ident, entity_type, &located, &current, &updated)
        });
        match outcome {
            Ok(()) => Ok(updated),
            Err(DbError::WriteConflict(txn)) => {
                debug!(txn, %ident, "Update lost a write-write race");
                Err(DbError::ConcurrentModification(describe(entity_type, ident)))
            }
            Err(e) => Err(e),
        }
    }

    fn delete(&self, ident: &NameIdentifier, entity_type: EntityType, cascade: bool) -> Result<bool> {
        self.execute_in_transaction(|session| session.delete(ident, entity_type, cascade))
    }

    fn close(&self) -> Result<()> {
        self.coordinator.backend().close()
    }
}

fn describe(entity_type: EntityType, ident: &NameIdentifier) -> String {
    format!("{} {}", entity_type, ident)
}

fn not_found(entity_type: EntityType, ident: &NameIdentifier) -> DbError {
    DbError::NotFound(describe(entity_type, ident))
}

/// Changes an updater is not allowed to make.
fn check_update(current: &Entity, updated: &Entity) -> Result<()> {
    if updated.entity_type() != current.entity_type() {
        return Err(DbError::InvalidArgument(format!(
            "updater changed the type of '{}' from {} to {}",
            current.name(),
            current.entity_type(),
            updated.entity_type()
        )));
    }
    if updated.id() != current.id() {
        return Err(DbError::InvalidArgument(format!(
            "updater changed the id of '{}' from {} to {}",
            current.name(),
            current.id(),
            updated.id()
        )));
    }
    if updated.namespace() != current.namespace() {
        return Err(DbError::InvalidArgument(format!(
            "updater moved '{}' from '{}' to '{}'",
            current.name(),
            current.namespace(),
            updated.namespace()
        )));
    }
    updated.validate()
}

/// Where a live entity sits in the backend.
#[derive(Debug, Clone)]
pub struct Located {
    namespace_ids: Vec<i64>,
    id: i64,
    key: Vec<u8>,
    record: StoredRecord,
}

/// Store operations bound to one transaction.
pub struct StoreSession<'s, 'a> {
    store: &'s KvEntityStore,
    scope: &'s mut TxnScope<'a>,
}

impl<'s, 'a> StoreSession<'s, 'a> {
    fn mapping(&mut self) -> MappingSession<'_, 'a> {
        self.store.mapping.session(&mut *self.scope)
    }

    /// Name mapping operations in this session's transaction.
    pub fn name_mapping(&mut self) -> MappingSession<'_, 'a> {
        self.mapping()
    }

    /// Nested unit of work sharing this session's transaction.
    pub fn execute_in_transaction<R, E, F>(&mut self, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut StoreSession<'s, 'a>) -> std::result::Result<R, E>,
    {
        work(self)
    }

    /// Ids of every namespace level, or `None` if a level is not mapped.
    fn resolve_namespace(&mut self, namespace: &Namespace) -> Result<Option<Vec<i64>>> {
        let mut ids = Vec::with_capacity(namespace.len());
        for (depth, level) in namespace.levels().iter().enumerate() {
            let level_type = level_type(depth).ok_or_else(|| {
                DbError::InvalidArgument(format!("namespace '{}' is too deep", namespace))
            })?;
            let name = mapping_name(level_type, &ids, level);
            match self.mapping().get(&name)? {
                Some(id) => ids.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some(ids))
    }

    fn read_record(&mut self, key: &[u8]) -> Result<Option<StoredRecord>> {
        self.scope
            .get(key)?
            .map(|bytes| StoredRecord::decode(&bytes))
            .transpose()
    }

    fn locate(&mut self, ident: &NameIdentifier, entity_type: EntityType) -> Result<Option<Located>> {
        entity_type.validate_namespace(ident.namespace())?;
        let Some(namespace_ids) = self.resolve_namespace(ident.namespace())? else {
            return Ok(None);
        };
        let Some(id) = self.mapping().get(&mapping_name(entity_type, &namespace_ids, ident.name()))? else {
            return Ok(None);
        };
        let key = entity_key(entity_type, &namespace_ids, id);
        match self.read_record(&key)? {
            Some(record) if !record.is_deleted() => Ok(Some(Located {
                namespace_ids,
                id,
                key,
                record,
            })),
            _ => Ok(None),
        }
    }

    fn decode(&self, located: &Located, namespace: Namespace, entity_type: EntityType) -> Result<Entity> {
        self.store
            .serde
            .deserialize(&located.record.payload, entity_type, namespace)
    }

    pub fn list(&mut self, namespace: &Namespace, entity_type: EntityType) -> Result<Vec<Entity>> {
        entity_type.validate_namespace(namespace)?;
        let Some(namespace_ids) = self.resolve_namespace(namespace)? else {
            return Ok(Vec::new());
        };
        let range = KvRangeScan::prefix(&namespace_prefix(entity_type, &namespace_ids));
        let mut entities = Vec::new();
        for (_, bytes) in self.scope.scan(&range)? {
            let record = StoredRecord::decode(&bytes)?;
            if record.is_deleted() {
                continue;
            }
            entities.push(self.store.serde.deserialize(
                &record.payload,
                entity_type,
                namespace.clone(),
            )?);
        }
        Ok(entities)
    }

    pub fn exists(&mut self, ident: &NameIdentifier, entity_type: EntityType) -> Result<bool> {
        Ok(self.locate(ident, entity_type)?.is_some())
    }

    pub fn get(&mut self, ident: &NameIdentifier, entity_type: EntityType) -> Result<Entity> {
        let located = self
            .locate(ident, entity_type)?
            .ok_or_else(|| not_found(entity_type, ident))?;
        self.decode(&located, ident.namespace().clone(), entity_type)
    }

    pub fn put(&mut self, entity: &Entity, overwrite: bool) -> Result<()> {
        entity.validate()?;
        let entity_type = entity.entity_type();
        let ident = entity.name_identifier();
        let namespace_ids = self.resolve_namespace(entity.namespace())?.ok_or_else(|| {
            DbError::NotFound(format!(
                "parent '{}' of {}",
                entity.namespace(),
                describe(entity_type, &ident)
            ))
        })?;
        self.guard_parent(&namespace_ids)?;
        let name = mapping_name(entity_type, &namespace_ids, entity.name());
        let payload = self.store.serde.serialize(entity)?;

        if let Some(existing_id) = self.mapping().get(&name)? {
            let key = entity_key(entity_type, &namespace_ids, existing_id);
            match self.read_record(&key)? {
                Some(record) if !record.is_deleted() => {
                    if !overwrite {
                        return Err(DbError::AlreadyExists(describe(entity_type, &ident)));
                    }
                    if existing_id != entity.id() {
                        return Err(DbError::InvalidArgument(format!(
                            "{} is stored with id {}, cannot overwrite it with id {}",
                            describe(entity_type, &ident),
                            existing_id,
                            entity.id()
                        )));
                    }
                    self.scope.put(&key, &record.replaced_by(payload).encode(), true)?;
                    debug!(entity = %ident, id = existing_id, "Entity overwritten");
                    return Ok(());
                }
                // The name is mapped but its record is gone or of another
                // type; a live record of another type keeps the name.
                _ => {
                    if self.holds_live_record(existing_id, &namespace_ids)? {
                        return Err(DbError::AlreadyExists(format!(
                            "name '{}' is taken by another entity",
                            ident
                        )));
                    }
                    self.mapping().delete(&name)?;
                }
            }
        }

        self.mapping().bind(&name, entity.id())?;
        let key = entity_key(entity_type, &namespace_ids, entity.id());
        self.scope.put(&key, &StoredRecord::new(payload).encode(), true)?;
        debug!(entity = %ident, id = entity.id(), "Entity created");
        Ok(())
    }

    /// Makes the commit fail if the parent record changes before it.
    fn guard_parent(&mut self, namespace_ids: &[i64]) -> Result<()> {
        let Some((&parent_id, ancestors)) = namespace_ids.split_last() else {
            return Ok(());
        };
        let parent_type = level_type(ancestors.len()).ok_or_else(|| {
            DbError::InvalidArgument(format!("namespace of depth {} is too deep", namespace_ids.len()))
        })?;
        self.scope
            .guard_key(&entity_key(parent_type, ancestors, parent_id))
    }

    /// Whether any type keeps a live record with `id` under `namespace_ids`.
    fn holds_live_record(&mut self, id: i64, namespace_ids: &[i64]) -> Result<bool> {
        for entity_type in EntityType::ALL {
            if entity_type.namespace_depth() != namespace_ids.len() {
                continue;
            }
            let key = entity_key(entity_type, namespace_ids, id);
            if let Some(record) = self.read_record(&key)? {
                if !record.is_deleted() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Read-modify-write inside this session's transaction.
    pub fn update<F>(&mut self, ident: &NameIdentifier, entity_type: EntityType, updater: F) -> Result<Entity>
    where
        F: FnOnce(Entity) -> Result<Entity>,
    {
        let located = self
            .locate(ident, entity_type)?
            .ok_or_else(|| not_found(entity_type, ident))?;
        let current = self.decode(&located, ident.namespace().clone(), entity_type)?;
        let updated = updater(current.clone())?;
        check_update(&current, &updated)?;
        self.write_update(ident, entity_type, &located, &current, &updated)?;
        Ok(updated)
    }

    /// Writes `updated` if the record still carries the version `located`
    /// was read at.
    fn write_update(
        &mut self,
        ident: &NameIdentifier,
        entity_type: EntityType,
        located: &Located,
        current: &Entity,
        updated: &Entity,
    ) -> Result<()> {
        let record = self
            .read_record(&located.key)?
            .ok_or_else(|| not_found(entity_type, ident))?;
        if record.is_deleted()
            || record.marker.current_version != located.record.marker.current_version
        {
            return Err(DbError::ConcurrentModification(describe(entity_type, ident)));
        }

        if updated.name() != current.name() {
            let old_name = mapping_name(entity_type, &located.namespace_ids, current.name());
            let new_name = mapping_name(entity_type, &located.namespace_ids, updated.name());
            if !self.mapping().update(&old_name, &new_name)? {
                return Err(DbError::ConcurrentModification(describe(entity_type, ident)));
            }
            debug!(from = current.name(), to = updated.name(), id = located.id, "Entity renamed");
        }

        let payload = self.store.serde.serialize(updated)?;
        self.scope
            .put(&located.key, &record.replaced_by(payload).encode(), true)?;
        Ok(())
    }

    pub fn delete(&mut self, ident: &NameIdentifier, entity_type: EntityType, cascade: bool) -> Result<bool> {
        let Some(located) = self.locate(ident, entity_type)? else {
            return Ok(false);
        };
        let mut own_ids = located.namespace_ids.clone();
        own_ids.push(located.id);

        if !cascade {
            for child_type in entity_type.direct_children() {
                if self.has_live(*child_type, &own_ids)? {
                    return Err(DbError::NonEmpty(describe(entity_type, ident)));
                }
            }
        }

        let now = Utc::now();
        let mut removed = 0;
        for descendant in entity_type.descendants() {
            let always = matches!(
                descendant,
                EntityType::User | EntityType::Group | EntityType::Role
            );
            if cascade || always {
                removed += self.soft_delete_under(*descendant, &own_ids, now)?;
            }
        }

        self.scope
            .put(&located.key, &located.record.soft_deleted(now).encode(), true)?;
        self.release_mapping(located.id)?;
        debug!(entity = %ident, id = located.id, descendants = removed, "Entity soft-deleted");
        Ok(true)
    }

    fn has_live(&mut self, entity_type: EntityType, ancestor_ids: &[i64]) -> Result<bool> {
        let range = KvRangeScan::prefix(&namespace_prefix(entity_type, ancestor_ids));
        self.scope.guard_range(&range)?;
        for (_, bytes) in self.scope.scan(&range)? {
            if !StoredRecord::decode(&bytes)?.is_deleted() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn soft_delete_under(
        &mut self,
        entity_type: EntityType,
        ancestor_ids: &[i64],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let range = KvRangeScan::prefix(&namespace_prefix(entity_type, ancestor_ids));
        self.scope.guard_range(&range)?;
        let mut count = 0;
        for (key, bytes) in self.scope.scan(&range)? {
            let record = StoredRecord::decode(&bytes)?;
            if record.is_deleted() {
                continue;
            }
            let (_, _, id) = decode_entity_key(&key)?;
            self.scope.put(&key, &record.soft_deleted(now).encode(), true)?;
            self.release_mapping(id)?;
            count += 1;
        }
        Ok(count)
    }

    fn release_mapping(&mut self, id: i64) -> Result<()> {
        let mut mapping = self.mapping();
        if let Some(name) = mapping.get_name(id)? {
            mapping.delete(&name)?;
        }
        Ok(())
    }

    fn deleted_records(
        &mut self,
        entity_type: EntityType,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Vec<u8>, StoredRecord)>> {
        let cutoff = cutoff.timestamp_millis();
        let range = KvRangeScan::prefix(&type_prefix(entity_type));
        let mut out = Vec::new();
        for (key, bytes) in self.scope.scan(&range)? {
            let record = StoredRecord::decode(&bytes)?;
            if record.is_deleted() && record.marker.deleted_at < cutoff {
                out.push((key, record));
            }
        }
        Ok(out)
    }

    pub fn list_deleted_before(
        &mut self,
        entity_type: EntityType,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeletedEntity>> {
        let mut deleted = Vec::new();
        for (key, record) in self.deleted_records(entity_type, cutoff)? {
            let (_, namespace_ids, id) = decode_entity_key(&key)?;
            let entity =
                self.store
                    .serde
                    .deserialize(&record.payload, entity_type, Namespace::empty())?;
            let deleted_at = record.marker.deleted_time().ok_or_else(|| {
                DbError::Serialization(format!(
                    "deleted_at {} of {} {} is out of range",
                    record.marker.deleted_at, entity_type, id
                ))
            })?;
            deleted.push(DeletedEntity {
                entity_type,
                id,
                name: entity.name().to_string(),
                namespace_ids,
                deleted_at,
                version: record.marker.current_version,
            });
        }
        Ok(deleted)
    }

    pub fn purge_deleted_before(&mut self, entity_type: EntityType, cutoff: DateTime<Utc>) -> Result<usize> {
        let doomed = self.deleted_records(entity_type, cutoff)?;
        for (key, _) in &doomed {
            self.scope.delete(key)?;
        }
        Ok(doomed.len())
    }

    /// Users of `metalake` holding `role`.
    pub fn list_users_by_role(&mut self, metalake: &str, role: &str) -> Result<Vec<UserEntity>> {
        let users = self.list(&Namespace::of([metalake]), EntityType::User)?;
        Ok(users
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::User(user) if user.roles.iter().any(|r| r == role) => Some(user),
                _ => None,
            })
            .collect())
    }
}
