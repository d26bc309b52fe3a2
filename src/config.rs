use crate::core::{DbError, Result};
use crate::storage::kv::mvcc::{BACKEND_NAME, DEFAULT_CHECKPOINT_THRESHOLD};
use crate::storage::persistence::DurabilityMode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const ENTITY_STORE: &str = "entity.store";
pub const KV_BACKEND: &str = "entity.kv.backend";
pub const KV_PATH: &str = "entity.kv.path";
pub const KV_DURABILITY: &str = "entity.kv.durability";
pub const KV_CHECKPOINT_THRESHOLD: &str = "entity.kv.checkpoint.threshold";
pub const ENTITY_SERDE: &str = "entity.serde";
pub const ID_GENERATOR: &str = "entity.id.generator";
pub const TRANSACTION_MAX_SKEW_SECONDS: &str = "entity.transaction.max.skew.seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGeneratorKind {
    #[default]
    Random,
    Timestamp,
}

impl std::str::FromStr for IdGeneratorKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(IdGeneratorKind::Random),
            "timestamp" => Ok(IdGeneratorKind::Timestamp),
            other => Err(DbError::Config(format!("unknown id generator '{}'", other))),
        }
    }
}

/// Entity store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend name, only `mvcc` is built in
    pub backend: String,

    /// Data directory; `None` keeps everything in memory
    pub path: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// Commits between automatic checkpoints
    pub checkpoint_threshold: usize,

    /// Payload encoding passed to `create_serde`
    pub serde: String,

    pub id_generator: IdGeneratorKind,

    /// Clock skew tolerated when the timestamp id generator restarts
    pub max_skew: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConfig {
    /// In-memory store with the default encoding and id generator
    pub fn new() -> Self {
        Self {
            backend: BACKEND_NAME.to_string(),
            path: None,
            durability: DurabilityMode::default(),
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
            serde: "msgpack".to_string(),
            id_generator: IdGeneratorKind::default(),
            max_skew: Duration::from_secs(2),
        }
    }

    /// Store persisted under `path`
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self::new().path(path)
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    pub fn serde(mut self, kind: &str) -> Self {
        self.serde = kind.to_string();
        self
    }

    pub fn id_generator(mut self, kind: IdGeneratorKind) -> Self {
        self.id_generator = kind;
        self
    }

    pub fn max_skew(mut self, skew: Duration) -> Self {
        self.max_skew = skew;
        self
    }

    /// Parses the flat `entity.*` property map. Unknown keys are ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(kind) = props.get(ENTITY_STORE) {
            match kind.to_ascii_lowercase().as_str() {
                "kv" => {}
                "relational" => {
                    return Err(DbError::UnsupportedOperation(
                        "the relational entity store is not available".to_string(),
                    ));
                }
                other => {
                    return Err(DbError::Config(format!("unknown entity store '{}'", other)));
                }
            }
        }
        if let Some(backend) = props.get(KV_BACKEND) {
            config.backend = backend.to_ascii_lowercase();
        }
        if let Some(path) = props.get(KV_PATH).filter(|p| !p.trim().is_empty()) {
            config.path = Some(PathBuf::from(path));
        }
        if let Some(durability) = props.get(KV_DURABILITY) {
            config.durability = durability.parse()?;
        }
        if let Some(threshold) = props.get(KV_CHECKPOINT_THRESHOLD) {
            config.checkpoint_threshold = parse_number(KV_CHECKPOINT_THRESHOLD, threshold)?;
        }
        if let Some(serde) = props.get(ENTITY_SERDE) {
            config.serde = serde.clone();
        }
        if let Some(generator) = props.get(ID_GENERATOR) {
            config.id_generator = generator.parse()?;
        }
        if let Some(skew) = props.get(TRANSACTION_MAX_SKEW_SECONDS) {
            config.max_skew = Duration::from_secs(parse_number(TRANSACTION_MAX_SKEW_SECONDS, skew)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend != BACKEND_NAME {
            return Err(DbError::Config(format!(
                "unknown kv backend '{}', expected '{}'",
                self.backend, BACKEND_NAME
            )));
        }
        if self.checkpoint_threshold == 0 {
            return Err(DbError::Config(format!(
                "{} must be > 0",
                KV_CHECKPOINT_THRESHOLD
            )));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| DbError::Config(format!("{} expects a number, got '{}'", key, raw)))
}
