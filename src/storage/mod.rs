pub mod id_generator;
pub mod kv;
pub mod name_mapping;
pub mod persistence;

pub use id_generator::{IdGenerator, RandomIdGenerator, TimestampIdGenerator};
pub use kv::{KvBackend, KvRangeScan, KvTransaction, MvccKvBackend};
pub use name_mapping::{KvNameMappingService, MappingSession, NameMappingService};
pub use persistence::DurabilityMode;
