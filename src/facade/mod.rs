pub mod async_store;
pub mod meta_store;

pub use async_store::AsyncEntityStore;
pub use meta_store::MetaStore;
