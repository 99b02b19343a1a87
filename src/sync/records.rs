//! Durable file metadata rows.
//!
//! Each synced workspace file carries a record (path, size, version,
//! source, checksum). Records live in the shared key/value store, one hash
//! per conversation, since that store is the only mutable state shared
//! across replicas.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::keys;

/// Who produced the current version of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    UserUpload,
    AiCreated,
    AiModified,
}

/// Metadata row for one workspace file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub version: u32,
    pub source: FileSource,
    /// SHA-256 of the content, hex-encoded; drives change detection.
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Upsert semantics: a new path starts at version 1 as `ai_created`;
    /// an existing path whose size or checksum changed gets its version
    /// bumped and its source set to `ai_modified`. An unchanged file is
    /// returned as-is, which is what makes re-syncing idempotent.
    pub fn upsert(existing: Option<FileRecord>, path: &str, size: u64, checksum: &str) -> Self {
        match existing {
            Some(mut record) => {
                if record.size != size || record.checksum != checksum {
                    record.size = size;
                    record.checksum = checksum.to_string();
                    record.version += 1;
                    record.source = FileSource::AiModified;
                    record.updated_at = Utc::now();
                }
                record
            }
            None => FileRecord {
                path: path.to_string(),
                size,
                version: 1,
                source: FileSource::AiCreated,
                checksum: checksum.to_string(),
                updated_at: Utc::now(),
            },
        }
    }
}

/// Store access for file records.
#[derive(Clone)]
pub struct FileRecordStore {
    con: ConnectionManager,
}

impl FileRecordStore {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }

    fn records_key(conversation_id: &str) -> String {
        format!("{}:{}", keys::FILES, conversation_id)
    }

    pub async fn list(&self, conversation_id: &str) -> Result<Vec<FileRecord>> {
        let mut con = self.con.clone();
        let raw: HashMap<String, String> =
            con.hgetall(Self::records_key(conversation_id)).await?;
        let mut records: Vec<FileRecord> = raw
            .values()
            .filter_map(|value| serde_json::from_str(value).ok())
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    pub async fn get(&self, conversation_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let mut con = self.con.clone();
        let raw: Option<String> = con.hget(Self::records_key(conversation_id), path).await?;
        Ok(raw.and_then(|value| serde_json::from_str(&value).ok()))
    }

    pub async fn put(&self, conversation_id: &str, record: &FileRecord) -> Result<()> {
        let mut con = self.con.clone();
        let value = serde_json::to_string(record).unwrap_or_default();
        let _: () = con
            .hset(Self::records_key(conversation_id), &record.path, value)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, conversation_id: &str, path: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.hdel(Self::records_key(conversation_id), path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_new_path_starts_at_version_one() {
        let record = FileRecord::upsert(None, "out/report.md", 120, "abc");
        assert_eq!(record.version, 1);
        assert_eq!(record.source, FileSource::AiCreated);
        assert_eq!(record.size, 120);
    }

    #[test]
    fn test_upsert_changed_content_bumps_version() {
        let first = FileRecord::upsert(None, "out/report.md", 120, "abc");
        let second = FileRecord::upsert(Some(first.clone()), "out/report.md", 140, "def");
        assert_eq!(second.version, 2);
        assert_eq!(second.source, FileSource::AiModified);
        assert_eq!(second.size, 140);
    }

    #[test]
    fn test_upsert_unchanged_content_is_idempotent() {
        let first = FileRecord::upsert(None, "out/report.md", 120, "abc");
        let second = FileRecord::upsert(Some(first.clone()), "out/report.md", 120, "abc");
        assert_eq!(second, first);
    }

    #[test]
    fn test_upsert_checksum_change_with_same_size() {
        let first = FileRecord::upsert(None, "data.bin", 64, "aaaa");
        let second = FileRecord::upsert(Some(first), "data.bin", 64, "bbbb");
        assert_eq!(second.version, 2);
        assert_eq!(second.source, FileSource::AiModified);
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let record = FileRecord::upsert(None, "a/b.txt", 5, "ffff");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"ai_created\""));
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
