//! Bidirectional name <-> id mapping kept in the key-value backend.
//!
//! Every mapping is two keys written in the same transaction:
//!
//! ```text
//! name_<name>     -> <8-byte big-endian id>
//! id_<8-byte id>  -> <name>
//! ```
//!
//! so lookups in both directions are single point reads and the two sides
//! never drift apart.

use crate::core::{DbError, Result};
use crate::storage::id_generator::IdGenerator;
use crate::transaction::{TransactionCoordinator, TxnScope};
use std::sync::Arc;
use tracing::debug;

pub const NAME_PREFIX: &[u8] = b"name_";
pub const ID_PREFIX: &[u8] = b"id_";

// A freshly drawn id that is already taken is redrawn this many times.
const MAX_ID_DRAWS: usize = 8;

pub fn name_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(NAME_PREFIX.len() + name.len());
    key.extend_from_slice(NAME_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn id_key(id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_PREFIX.len() + 8);
    key.extend_from_slice(ID_PREFIX);
    key.extend_from_slice(&encode_id(id));
    key
}

pub fn encode_id(id: i64) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn decode_id(bytes: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        DbError::Serialization(format!("id has {} bytes, expected 8", bytes.len()))
    })?;
    Ok(i64::from_be_bytes(raw))
}

pub trait NameMappingService: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<i64>>;

    /// Reverse lookup.
    fn get_name(&self, id: i64) -> Result<Option<String>>;

    /// Allocates a new id for `name`; `AlreadyExists` if it is mapped.
    fn create(&self, name: &str) -> Result<i64>;

    fn get_or_create_id(&self, name: &str) -> Result<i64>;

    /// Moves the id of `old_name` to `new_name`. Returns `false` when
    /// `old_name` is not mapped.
    fn update(&self, old_name: &str, new_name: &str) -> Result<bool>;

    /// Returns `false` when `name` is not mapped.
    fn delete(&self, name: &str) -> Result<bool>;

    fn id_generator(&self) -> &Arc<dyn IdGenerator>;
}

pub struct KvNameMappingService {
    coordinator: TransactionCoordinator,
    id_generator: Arc<dyn IdGenerator>,
}

impl KvNameMappingService {
    pub fn new(coordinator: TransactionCoordinator, id_generator: Arc<dyn IdGenerator>) -> Self {
        Self {
            coordinator,
            id_generator,
        }
    }

    /// Binds mapping operations to an already running transaction.
    pub fn session<'s, 'a>(&'s self, scope: &'s mut TxnScope<'a>) -> MappingSession<'s, 'a> {
        MappingSession::new(self.id_generator.as_ref(), scope)
    }

    /// Runs several mapping operations atomically. Any error rolls all of
    /// them back and is returned unchanged.
    pub fn execute_in_transaction<R, E, F>(&self, work: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut MappingSession<'_, '_>) -> std::result::Result<R, E>,
        E: From<DbError>,
    {
        self.coordinator.execute_in_transaction(|scope| {
            let mut session = self.session(scope);
            work(&mut session)
        })
    }
}

impl NameMappingService for KvNameMappingService {
    fn get(&self, name: &str) -> Result<Option<i64>> {
        self.execute_in_transaction(|session| session.get(name))
    }

    fn get_name(&self, id: i64) -> Result<Option<String>> {
        self.execute_in_transaction(|session| session.get_name(id))
    }

    fn create(&self, name: &str) -> Result<i64> {
        self.execute_in_transaction(|session| session.create(name))
    }

    fn get_or_create_id(&self, name: &str) -> Result<i64> {
        self.execute_in_transaction(|session| session.get_or_create_id(name))
    }

    fn update(&self, old_name: &str, new_name: &str) -> Result<bool> {
        self.execute_in_transaction(|session| session.update(old_name, new_name))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        self.execute_in_transaction(|session| session.delete(name))
    }

    fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.id_generator
    }
}

/// Mapping operations bound to one transaction.
pub struct MappingSession<'s, 'a> {
    id_generator: &'s dyn IdGenerator,
    scope: &'s mut TxnScope<'a>,
}

impl<'s, 'a> MappingSession<'s, 'a> {
    pub fn new(id_generator: &'s dyn IdGenerator, scope: &'s mut TxnScope<'a>) -> Self {
        Self {
            id_generator,
            scope,
        }
    }

    pub fn get(&mut self, name: &str) -> Result<Option<i64>> {
        self.scope
            .get(&name_key(name))?
            .map(|bytes| decode_id(&bytes))
            .transpose()
    }

    pub fn get_name(&mut self, id: i64) -> Result<Option<String>> {
        match self.scope.get(&id_key(id))? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
                DbError::Serialization(format!("mapping for id {} is not UTF-8: {}", id, e))
            }),
        }
    }

    pub fn create(&mut self, name: &str) -> Result<i64> {
        if self.get(name)?.is_some() {
            return Err(DbError::AlreadyExists(format!("name '{}' is already mapped", name)));
        }
        let id = self.allocate_id()?;
        self.bind(name, id)?;
        Ok(id)
    }

    pub fn get_or_create_id(&mut self, name: &str) -> Result<i64> {
        match self.get(name)? {
            Some(id) => Ok(id),
            None => self.create(name),
        }
    }

    /// Maps `name` to an id chosen by the caller.
    pub fn bind(&mut self, name: &str, id: i64) -> Result<()> {
        if id <= 0 {
            return Err(DbError::InvalidArgument(format!(
                "id must be positive, got {}",
                id
            )));
        }
        if let Some(existing) = self.get_name(id)? {
            if existing != name {
                return Err(DbError::AlreadyExists(format!(
                    "id {} is already mapped to '{}'",
                    id, existing
                )));
            }
        }
        self.scope.put(&name_key(name), &encode_id(id), false)?;
        self.scope.put(&id_key(id), name.as_bytes(), true)?;
        debug!(name, id, "Name mapping bound");
        Ok(())
    }

    pub fn update(&mut self, old_name: &str, new_name: &str) -> Result<bool> {
        let Some(id) = self.get(old_name)? else {
            return Ok(false);
        };
        if old_name == new_name {
            return Ok(true);
        }
        if let Some(other) = self.get(new_name)? {
            return Err(DbError::AlreadyExists(format!(
                "name '{}' is already mapped to id {}",
                new_name, other
            )));
        }
        self.scope.delete(&name_key(old_name))?;
        self.scope.put(&name_key(new_name), &encode_id(id), false)?;
        self.scope.put(&id_key(id), new_name.as_bytes(), true)?;
        debug!(old_name, new_name, id, "Name mapping moved");
        Ok(true)
    }

    pub fn delete(&mut self, name: &str) -> Result<bool> {
        let Some(id) = self.get(name)? else {
            return Ok(false);
        };
        self.scope.delete(&name_key(name))?;
        if self.get_name(id)?.as_deref() == Some(name) {
            self.scope.delete(&id_key(id))?;
        }
        debug!(name, id, "Name mapping removed");
        Ok(true)
    }

    fn allocate_id(&mut self) -> Result<i64> {
        for _ in 0..MAX_ID_DRAWS {
            let id = self.id_generator.next_id();
            if self.scope.get(&id_key(id))?.is_none() {
                return Ok(id);
            }
        }
        Err(DbError::Backend(format!(
            "no free id after {} draws from the {} generator",
            MAX_ID_DRAWS,
            self.id_generator.name()
        )))
    }
}
