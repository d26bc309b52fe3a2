use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Entity '{0}' not found")]
    NotFound(String),

    #[error("Entity '{0}' already exists")]
    AlreadyExists(String),

    #[error("Entity '{0}' has sub-entities, remove them first or delete with cascade")]
    NonEmpty(String),

    #[error("Concurrent modification of '{0}', the record changed since it was read")]
    ConcurrentModification(String),

    #[error("Write-write conflict detected in transaction {0}")]
    WriteConflict(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Transaction error: {0}")]
    TransactionState(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Conflicts the caller may resolve by retrying the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::ConcurrentModification(_) | DbError::WriteConflict(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
