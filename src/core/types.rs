use super::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered path of segments locating an entity in the hierarchy.
///
/// Segments are opaque and case sensitive. The root (metalake level)
/// namespace is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    levels: Vec<String>,
}

impl Namespace {
    pub fn empty() -> Self {
        Self { levels: Vec::new() }
    }

    pub fn of<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            levels: levels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn level(&self, idx: usize) -> Option<&str> {
        self.levels.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Namespace of the entity this namespace points at, i.e. all levels but
    /// the last one.
    pub fn parent(&self) -> Option<Namespace> {
        if self.levels.is_empty() {
            return None;
        }
        Some(Self {
            levels: self.levels[..self.levels.len() - 1].to_vec(),
        })
    }

    /// Identifier of the entity this namespace points at.
    pub fn to_identifier(&self) -> Option<NameIdentifier> {
        let name = self.levels.last()?;
        let parent = self.parent()?;
        Some(NameIdentifier::new(parent, name.clone()))
    }

    pub fn child(&self, segment: impl Into<String>) -> Namespace {
        let mut levels = self.levels.clone();
        levels.push(segment.into());
        Self { levels }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.join("."))
    }
}

/// Namespace plus leaf name, the external handle of every entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameIdentifier {
    namespace: Namespace,
    name: String,
}

impl NameIdentifier {
    pub fn new(namespace: Namespace, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Builds an identifier from all of its segments, the last one being the
    /// leaf name.
    pub fn of<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut levels: Vec<String> = segments.into_iter().map(Into::into).collect();
        let name = levels
            .pop()
            .ok_or_else(|| DbError::InvalidArgument("identifier needs at least a name".into()))?;
        if name.is_empty() {
            return Err(DbError::InvalidArgument("identifier name is empty".into()));
        }
        Ok(Self {
            namespace: Namespace { levels },
            name,
        })
    }

    /// Parses the dotted form `metalake.catalog.schema.table`.
    pub fn parse(dotted: &str) -> Result<Self> {
        if dotted.is_empty() {
            return Err(DbError::InvalidArgument("identifier is empty".into()));
        }
        Self::of(dotted.split('.'))
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace that holds this entity's children.
    pub fn child_namespace(&self) -> Namespace {
        self.namespace.child(self.name.clone())
    }
}

impl fmt::Display for NameIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

/// Type tag of every stored entity. Stored as a two byte prefix of each
/// entity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Metalake,
    Catalog,
    Schema,
    Table,
    Fileset,
    Topic,
    User,
    Group,
    Role,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Metalake,
        EntityType::Catalog,
        EntityType::Schema,
        EntityType::Table,
        EntityType::Fileset,
        EntityType::Topic,
        EntityType::User,
        EntityType::Group,
        EntityType::Role,
    ];

    pub fn short_name(&self) -> &'static str {
        match self {
            EntityType::Metalake => "ml",
            EntityType::Catalog => "ca",
            EntityType::Schema => "sc",
            EntityType::Table => "ta",
            EntityType::Fileset => "fi",
            EntityType::Topic => "to",
            EntityType::User => "us",
            EntityType::Group => "gr",
            EntityType::Role => "ro",
        }
    }

    pub fn from_short_name(short: &[u8]) -> Option<EntityType> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.short_name().as_bytes() == short)
    }

    /// Number of namespace levels an entity of this type lives under.
    pub fn namespace_depth(&self) -> usize {
        match self {
            EntityType::Metalake => 0,
            EntityType::Catalog | EntityType::User | EntityType::Group | EntityType::Role => 1,
            EntityType::Schema => 2,
            EntityType::Table | EntityType::Fileset | EntityType::Topic => 3,
        }
    }

    /// Type of the entity that owns this one, `None` for metalakes.
    pub fn parent(&self) -> Option<EntityType> {
        match self {
            EntityType::Metalake => None,
            EntityType::Catalog | EntityType::User | EntityType::Group | EntityType::Role => {
                Some(EntityType::Metalake)
            }
            EntityType::Schema => Some(EntityType::Catalog),
            EntityType::Table | EntityType::Fileset | EntityType::Topic => {
                Some(EntityType::Schema)
            }
        }
    }

    /// Types whose live records make a parent "non empty" for a
    /// non-cascading delete.
    pub fn direct_children(&self) -> &'static [EntityType] {
        match self {
            EntityType::Metalake => &[EntityType::Catalog],
            EntityType::Catalog => &[EntityType::Schema],
            EntityType::Schema => &[EntityType::Table, EntityType::Fileset, EntityType::Topic],
            _ => &[],
        }
    }

    /// Every type stored below an entity of this type, deepest first.
    pub fn descendants(&self) -> &'static [EntityType] {
        match self {
            EntityType::Metalake => &[
                EntityType::Table,
                EntityType::Fileset,
                EntityType::Topic,
                EntityType::Schema,
                EntityType::Catalog,
                EntityType::User,
                EntityType::Group,
                EntityType::Role,
            ],
            EntityType::Catalog => &[
                EntityType::Table,
                EntityType::Fileset,
                EntityType::Topic,
                EntityType::Schema,
            ],
            EntityType::Schema => &[EntityType::Table, EntityType::Fileset, EntityType::Topic],
            _ => &[],
        }
    }

    pub fn validate_namespace(&self, namespace: &Namespace) -> Result<()> {
        if namespace.len() != self.namespace_depth() {
            return Err(DbError::InvalidArgument(format!(
                "{} namespace must have {} level(s), got '{}'",
                self,
                self.namespace_depth(),
                namespace
            )));
        }
        Ok(())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityType::Metalake => "METALAKE",
            EntityType::Catalog => "CATALOG",
            EntityType::Schema => "SCHEMA",
            EntityType::Table => "TABLE",
            EntityType::Fileset => "FILESET",
            EntityType::Topic => "TOPIC",
            EntityType::User => "USER",
            EntityType::Group => "GROUP",
            EntityType::Role => "ROLE",
        };
        write!(f, "{}", label)
    }
}
