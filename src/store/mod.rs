pub mod key_encoder;
pub mod kv_store;
pub mod record;

pub use kv_store::{DeletedEntity, EntityStore, KvEntityStore, StoreSession};
pub use record::{StoredRecord, VersionMarker};
