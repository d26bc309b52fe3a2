// ============================================================================
// Catalog Entities
// ============================================================================
//
// One payload struct per entity kind, joined by the `Entity` sum type. The
// namespace of an entity is never serialized: it is rebuilt from the storage
// key on read.
//
// ============================================================================

use super::AuditInfo;
use crate::core::{DbError, EntityType, NameIdentifier, Namespace, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Properties = BTreeMap<String, String>;

/// Version tag carried by metalakes.
pub const METALAKE_SCHEMA_VERSION: &str = "0.1";

fn validate_required(id: i64, name: &str, ty: EntityType) -> Result<()> {
    if id <= 0 {
        return Err(DbError::InvalidArgument(format!(
            "{} '{}' needs a positive id, got {}",
            ty, name, id
        )));
    }
    if name.is_empty() {
        return Err(DbError::InvalidArgument(format!("{} name is empty", ty)));
    }
    Ok(())
}

fn default_schema_version() -> String {
    METALAKE_SCHEMA_VERSION.to_string()
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetalakeEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub audit_info: AuditInfo,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

impl MetalakeEntity {
    pub fn new(id: i64, name: impl Into<String>, audit_info: AuditInfo) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Metalake)?;
        Ok(Self {
            id,
            name,
            namespace: Namespace::empty(),
            comment: None,
            properties: None,
            audit_info,
            schema_version: default_schema_version(),
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogType {
    Relational,
    Fileset,
    Messaging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    pub catalog_type: CatalogType,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub audit_info: AuditInfo,
}

impl CatalogEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        catalog_type: CatalogType,
        provider: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Catalog)?;
        EntityType::Catalog.validate_namespace(&namespace)?;
        let provider = provider.into();
        if provider.is_empty() {
            return Err(DbError::InvalidArgument(format!(
                "catalog '{}' needs a provider",
                name
            )));
        }
        Ok(Self {
            id,
            name,
            namespace,
            catalog_type,
            provider,
            comment: None,
            properties: None,
            audit_info,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub audit_info: AuditInfo,
}

impl SchemaEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Schema)?;
        EntityType::Schema.validate_namespace(&namespace)?;
        Ok(Self {
            id,
            name,
            namespace,
            comment: None,
            properties: None,
            audit_info,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnEntity {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

impl ColumnEntity {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            comment: None,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(default)]
    pub columns: Vec<ColumnEntity>,
    pub audit_info: AuditInfo,
}

impl TableEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Table)?;
        EntityType::Table.validate_namespace(&namespace)?;
        Ok(Self {
            id,
            name,
            namespace,
            comment: None,
            properties: None,
            columns: Vec::new(),
            audit_info,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_columns(mut self, columns: Vec<ColumnEntity>) -> Self {
        self.columns = columns;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesetType {
    Managed,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub fileset_type: FilesetType,
    pub storage_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub audit_info: AuditInfo,
}

impl FilesetEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        fileset_type: FilesetType,
        storage_location: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Fileset)?;
        EntityType::Fileset.validate_namespace(&namespace)?;
        let storage_location = storage_location.into();
        if storage_location.is_empty() {
            return Err(DbError::InvalidArgument(format!(
                "fileset '{}' needs a storage location",
                name
            )));
        }
        Ok(Self {
            id,
            name,
            namespace,
            comment: None,
            fileset_type,
            storage_location,
            properties: None,
            audit_info,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub audit_info: AuditInfo,
}

impl TopicEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Topic)?;
        EntityType::Topic.validate_namespace(&namespace)?;
        Ok(Self {
            id,
            name,
            namespace,
            comment: None,
            properties: None,
            audit_info,
        })
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default)]
    pub roles: Vec<String>,
    pub audit_info: AuditInfo,
}

impl UserEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::User)?;
        EntityType::User.validate_namespace(&namespace)?;
        Ok(Self {
            id,
            name,
            namespace,
            roles: Vec::new(),
            audit_info,
        })
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default)]
    pub roles: Vec<String>,
    pub audit_info: AuditInfo,
}

impl GroupEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Group)?;
        EntityType::Group.validate_namespace(&namespace)?;
        Ok(Self {
            id,
            name,
            namespace,
            roles: Vec::new(),
            audit_info,
        })
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntity {
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    pub securable_object: String,
    #[serde(default)]
    pub privileges: Vec<String>,
    pub audit_info: AuditInfo,
}

impl RoleEntity {
    pub fn new(
        id: i64,
        namespace: Namespace,
        name: impl Into<String>,
        securable_object: impl Into<String>,
        audit_info: AuditInfo,
    ) -> Result<Self> {
        let name = name.into();
        validate_required(id, &name, EntityType::Role)?;
        EntityType::Role.validate_namespace(&namespace)?;
        Ok(Self {
            id,
            name,
            namespace,
            properties: None,
            securable_object: securable_object.into(),
            privileges: Vec::new(),
            audit_info,
        })
    }

    pub fn with_privileges(mut self, privileges: Vec<String>) -> Self {
        self.privileges = privileges;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Any stored entity. The variant is selected by the type prefix of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Metalake(MetalakeEntity),
    Catalog(CatalogEntity),
    Schema(SchemaEntity),
    Table(TableEntity),
    Fileset(FilesetEntity),
    Topic(TopicEntity),
    User(UserEntity),
    Group(GroupEntity),
    Role(RoleEntity),
}

macro_rules! with_payload {
    ($entity:expr, $p:ident => $body:expr) => {
        match $entity {
            Entity::Metalake($p) => $body,
            Entity::Catalog($p) => $body,
            Entity::Schema($p) => $body,
            Entity::Table($p) => $body,
            Entity::Fileset($p) => $body,
            Entity::Topic($p) => $body,
            Entity::User($p) => $body,
            Entity::Group($p) => $body,
            Entity::Role($p) => $body,
        }
    };
}

pub(crate) use with_payload;

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Metalake(_) => EntityType::Metalake,
            Entity::Catalog(_) => EntityType::Catalog,
            Entity::Schema(_) => EntityType::Schema,
            Entity::Table(_) => EntityType::Table,
            Entity::Fileset(_) => EntityType::Fileset,
            Entity::Topic(_) => EntityType::Topic,
            Entity::User(_) => EntityType::User,
            Entity::Group(_) => EntityType::Group,
            Entity::Role(_) => EntityType::Role,
        }
    }

    pub fn id(&self) -> i64 {
        with_payload!(self, p => p.id)
    }

    pub fn name(&self) -> &str {
        with_payload!(self, p => p.name.as_str())
    }

    pub fn namespace(&self) -> &Namespace {
        with_payload!(self, p => &p.namespace)
    }

    pub fn audit_info(&self) -> &AuditInfo {
        with_payload!(self, p => &p.audit_info)
    }

    pub fn name_identifier(&self) -> NameIdentifier {
        NameIdentifier::new(self.namespace().clone(), self.name())
    }

    pub(crate) fn set_namespace(&mut self, namespace: Namespace) {
        with_payload!(self, p => p.namespace = namespace)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        with_payload!(self, p => p.name = name)
    }

    pub fn set_audit_info(&mut self, audit_info: AuditInfo) {
        with_payload!(self, p => p.audit_info = audit_info)
    }

    /// Checks the invariants every stored entity must satisfy.
    pub fn validate(&self) -> Result<()> {
        validate_required(self.id(), self.name(), self.entity_type())?;
        self.entity_type().validate_namespace(self.namespace())
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident($payload:ty)),* $(,)?) => {
        $(
            impl From<$payload> for Entity {
                fn from(value: $payload) -> Self {
                    Entity::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload!(
    Metalake(MetalakeEntity),
    Catalog(CatalogEntity),
    Schema(SchemaEntity),
    Table(TableEntity),
    Fileset(FilesetEntity),
    Topic(TopicEntity),
    User(UserEntity),
    Group(GroupEntity),
    Role(RoleEntity),
);

#[cfg(test)]
mod tests {
    use super::*;

    fn audit() -> AuditInfo {
        AuditInfo::created_by("tester")
    }

    #[test]
    fn test_constructor_rejects_missing_required_fields() {
        assert!(MetalakeEntity::new(0, "ml", audit()).is_err());
        assert!(MetalakeEntity::new(1, "", audit()).is_err());
        assert!(CatalogEntity::new(
            1,
            Namespace::of(["ml"]),
            "cat",
            CatalogType::Relational,
            "",
            audit()
        )
        .is_err());
        assert!(FilesetEntity::new(
            1,
            Namespace::of(["ml", "cat", "db"]),
            "fs",
            FilesetType::Managed,
            "",
            audit()
        )
        .is_err());
    }

    #[test]
    fn test_constructor_checks_namespace_depth() {
        let err = TableEntity::new(1, Namespace::of(["ml", "cat"]), "t", audit()).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
    }

    #[test]
    fn test_entity_accessors() {
        let schema = SchemaEntity::new(9, Namespace::of(["ml", "cat"]), "db", audit())
            .unwrap()
            .with_comment("sales");
        let entity = Entity::from(schema);
        assert_eq!(entity.entity_type(), EntityType::Schema);
        assert_eq!(entity.id(), 9);
        assert_eq!(entity.name_identifier().to_string(), "ml.cat.db");
        assert!(entity.validate().is_ok());
    }

    #[test]
    fn test_rename_through_setter() {
        let mut entity: Entity = TopicEntity::new(3, Namespace::of(["ml", "kafka", "default"]), "t1", audit())
            .unwrap()
            .into();
        entity.set_name("t2");
        assert_eq!(entity.name(), "t2");
    }
}
