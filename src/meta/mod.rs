pub mod audit;
pub mod entity;

pub use audit::AuditInfo;
pub use entity::{
    CatalogEntity, CatalogType, ColumnEntity, Entity, FilesetEntity, FilesetType, GroupEntity,
    METALAKE_SCHEMA_VERSION, MetalakeEntity, Properties, RoleEntity, SchemaEntity, TableEntity,
    TopicEntity, UserEntity,
};
