use super::AsyncEntityStore;
use crate::codec::create_serde;
use crate::config::{IdGeneratorKind, StoreConfig};
use crate::core::{DbError, Result};
use crate::storage::id_generator::{IdGenerator, RandomIdGenerator, TimestampIdGenerator};
use crate::storage::kv::{KvBackend, MvccKvBackend};
use crate::storage::name_mapping::KvNameMappingService;
use crate::store::KvEntityStore;
use crate::transaction::TransactionCoordinator;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// One opened metadata store and everything wired to it.
///
/// Construct it once and hand references (or clones of the inner `Arc`s)
/// to whoever needs them. Call [`close`](Self::close) to checkpoint and
/// release the backend; dropping an open store does the same.
pub struct MetaStore {
    config: StoreConfig,
    backend: Arc<MvccKvBackend>,
    coordinator: TransactionCoordinator,
    id_generator: Arc<dyn IdGenerator>,
    name_mapping: Arc<KvNameMappingService>,
    store: Arc<KvEntityStore>,
    closed: AtomicBool,
}

impl MetaStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let serde = create_serde(&config.serde)?;

        let backend = Arc::new(MvccKvBackend::open(
            config.path.as_deref(),
            config.durability,
            config.checkpoint_threshold,
        )?);
        let kv: Arc<dyn KvBackend> = backend.clone();
        let coordinator = TransactionCoordinator::new(kv.clone());

        let id_generator: Arc<dyn IdGenerator> = match config.id_generator {
            IdGeneratorKind::Random => Arc::new(RandomIdGenerator::new()),
            IdGeneratorKind::Timestamp => {
                let generator = TimestampIdGenerator::new(kv, config.max_skew);
                generator.start()?;
                Arc::new(generator)
            }
        };

        let name_mapping = Arc::new(KvNameMappingService::new(
            coordinator.clone(),
            id_generator.clone(),
        ));
        let store = Arc::new(KvEntityStore::new(
            coordinator.clone(),
            name_mapping.clone(),
            serde,
        ));

        info!(
            backend = backend.name(),
            path = ?config.path,
            serde = store.serde().name(),
            id_generator = id_generator.name(),
            "Metadata store opened"
        );

        Ok(Self {
            config,
            backend,
            coordinator,
            id_generator,
            name_mapping,
            store,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a store from the flat `entity.*` property map.
    pub fn open_with_properties(props: &HashMap<String, String>) -> Result<Self> {
        Self::open(StoreConfig::from_properties(props)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::new())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KvEntityStore> {
        &self.store
    }

    pub fn name_mapping(&self) -> &Arc<KvNameMappingService> {
        &self.name_mapping
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.id_generator
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn backend(&self) -> &Arc<MvccKvBackend> {
        &self.backend
    }

    pub fn async_store(&self) -> AsyncEntityStore {
        AsyncEntityStore::new(self.store.clone())
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        self.backend.checkpoint()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.close()?;
        info!("Metadata store closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::Backend("metadata store is closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for MetaStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Closing metadata store on drop failed");
        }
    }
}
