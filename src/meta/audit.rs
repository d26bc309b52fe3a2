use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who created an entity and who touched it last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub creator: String,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_time: Option<DateTime<Utc>>,
}

impl AuditInfo {
    pub fn new(creator: impl Into<String>, create_time: DateTime<Utc>) -> Self {
        Self {
            creator: creator.into(),
            create_time,
            last_modifier: None,
            last_modified_time: None,
        }
    }

    /// Audit info stamped with the current time.
    pub fn created_by(creator: impl Into<String>) -> Self {
        Self::new(creator, Utc::now())
    }

    pub fn modified_by(mut self, modifier: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.last_modifier = Some(modifier.into());
        self.last_modified_time = Some(at);
        self
    }
}
