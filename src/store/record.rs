//! Envelope every entity value is stored in.
//!
//! ```text
//! +-------+---------+-----------------+--------------+------------+---------+
//! | "RME" | format  | current_version | last_version | deleted_at | payload |
//! | 3 B   | 1 B     | u64 BE          | u64 BE       | i64 BE     | ...     |
//! +-------+---------+-----------------+--------------+------------+---------+
//! ```
//!
//! `deleted_at` is epoch millis of the soft delete, `0` while live.

use crate::core::{DbError, Result};
use chrono::{DateTime, Utc};

const MAGIC: &[u8; 3] = b"RME";
const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 3 + 1 + 8 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMarker {
    pub current_version: u64,
    pub last_version: u64,
    pub deleted_at: i64,
}

impl Default for VersionMarker {
    fn default() -> Self {
        Self::initial()
    }
}

impl VersionMarker {
    pub fn initial() -> Self {
        Self {
            current_version: 1,
            last_version: 1,
            deleted_at: 0,
        }
    }

    /// Marker for the next write of the same record.
    pub fn bumped(&self) -> Self {
        Self {
            current_version: self.current_version + 1,
            last_version: self.current_version,
            deleted_at: self.deleted_at,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at != 0
    }

    pub fn deleted_time(&self) -> Option<DateTime<Utc>> {
        if self.is_deleted() {
            DateTime::from_timestamp_millis(self.deleted_at)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub marker: VersionMarker,
    pub payload: Vec<u8>,
}

impl StoredRecord {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            marker: VersionMarker::initial(),
            payload,
        }
    }

    /// The record replacing this one with `payload`, versions bumped.
    pub fn replaced_by(&self, payload: Vec<u8>) -> Self {
        Self {
            marker: self.marker.bumped(),
            payload,
        }
    }

    /// Soft-deleted copy stamped with `at`.
    pub fn soft_deleted(&self, at: DateTime<Utc>) -> Self {
        let mut marker = self.marker.bumped();
        // 0 means live, so a delete at the epoch is recorded one milli late
        marker.deleted_at = at.timestamp_millis().max(1);
        Self {
            marker,
            payload: self.payload.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.marker.is_deleted()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.marker.current_version.to_be_bytes());
        out.extend_from_slice(&self.marker.last_version.to_be_bytes());
        out.extend_from_slice(&self.marker.deleted_at.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(DbError::Serialization(format!(
                "entity record of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        if &bytes[..3] != MAGIC {
            return Err(DbError::Serialization(
                "entity record has a bad magic".to_string(),
            ));
        }
        if bytes[3] != FORMAT_VERSION {
            return Err(DbError::Serialization(format!(
                "unsupported entity record format {}",
                bytes[3]
            )));
        }
        let marker = VersionMarker {
            current_version: read_u64(&bytes[4..12]),
            last_version: read_u64(&bytes[12..20]),
            deleted_at: read_u64(&bytes[20..28]) as i64,
        };
        Ok(Self {
            marker,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_starts_at_version_one() {
        let record = StoredRecord::new(b"payload".to_vec());
        assert_eq!(record.marker.current_version, 1);
        assert_eq!(record.marker.last_version, 1);
        assert!(!record.is_deleted());
    }

    #[test]
    fn test_replace_bumps_versions() {
        let record = StoredRecord::new(b"a".to_vec())
            .replaced_by(b"b".to_vec())
            .replaced_by(b"c".to_vec());
        assert_eq!(record.marker.current_version, 3);
        assert_eq!(record.marker.last_version, 2);
        assert_eq!(record.payload, b"c");
    }

    #[test]
    fn test_soft_delete_keeps_payload() {
        let at = Utc::now();
        let record = StoredRecord::new(b"a".to_vec()).soft_deleted(at);
        assert!(record.is_deleted());
        assert_eq!(record.marker.current_version, 2);
        assert_eq!(
            record.marker.deleted_time().map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );

        let decoded = StoredRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_rejects_foreign_bytes() {
        assert!(StoredRecord::decode(b"short").is_err());
        let mut bytes = StoredRecord::new(Vec::new()).encode();
        bytes[0] = b'X';
        assert!(matches!(
            StoredRecord::decode(&bytes),
            Err(DbError::Serialization(_))
        ));
    }
}
