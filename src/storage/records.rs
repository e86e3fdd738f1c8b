//! Analysis record stores
//!
//! Records are persisted as JSON documents in the shape the reconciler
//! reads back:
//!
//! ```json
//! {
//!   "talker": "wx_1",
//!   "timestamp": "2025-03-01T10:00:00+00:00",
//!   "group": "g1",
//!   "schema_version": "0.7.0",
//!   "system_id": "alice",
//!   "analysis": {"feedback": "...", "scores": {...}, "mentions": [], "version": "0.7.0"}
//! }
//! ```
//!
//! Both stores are append-only. Loading returns raw documents; shape
//! detection happens in the reconciler.

use crate::config::StorageConfig;
use crate::error::{CollabError, Result};
use crate::retry::sanitize_file_stem;
use crate::storage::Database;
use crate::types::AnalysisRecord;
use async_trait::async_trait;
use libsql::{params, Connection};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Filename timestamp layout used by the JSON directory store
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One raw persisted document and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Row id or file path, used in diagnostics and as a timestamp fallback
    pub source_ref: String,
    pub document: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist one record
    async fn append(&self, record: &AnalysisRecord) -> Result<()>;

    /// Raw documents written for any of the given handles
    async fn load_all_for_handles(&self, handles: &[String]) -> Result<Vec<StoredRecord>>;
}

/// Persisted document for a record
pub fn record_document(record: &AnalysisRecord) -> Value {
    let mut analysis = json!({
        "feedback": record.feedback,
        "scores": record.scores,
        "mentions": record.mentions,
        "version": record.schema_version,
        "attempts": record.attempts,
        "temperature": record.temperature,
    });
    if let Some(error) = &record.error {
        analysis["error"] = json!(error);
    }

    let mut document = json!({
        "id": record.id.to_string(),
        "talker": record.subject_handle,
        "timestamp": record.timestamp.to_rfc3339(),
        "group": record.group,
        "schema_version": record.schema_version,
        "analysis": analysis,
    });
    if let Some(identity) = &record.registered_identity {
        document["system_id"] = json!(identity);
    }
    document
}

/// Record store backed by the `analysis_records` table
pub struct LibsqlRecordStore {
    conn: Connection,
}

impl LibsqlRecordStore {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }
}

#[async_trait]
impl RecordStore for LibsqlRecordStore {
    async fn append(&self, record: &AnalysisRecord) -> Result<()> {
        let document = serde_json::to_string(&record_document(record))?;

        self.conn
            .execute(
                "INSERT INTO analysis_records
                 (id, subject_handle, group_name, created_at, schema_version, document)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    record.id.to_string(),
                    record.subject_handle.as_str(),
                    record.group.as_str(),
                    record.timestamp.to_rfc3339(),
                    record.schema_version.as_str(),
                    document
                ],
            )
            .await?;

        debug!("Stored analysis record {} for {}", record.id, record.subject_handle);
        Ok(())
    }

    async fn load_all_for_handles(&self, handles: &[String]) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::new();

        for handle in handles {
            let mut rows = self
                .conn
                .query(
                    "SELECT id, document FROM analysis_records
                     WHERE subject_handle = ? ORDER BY created_at",
                    params![handle.as_str()],
                )
                .await?;

            while let Some(row) = rows.next().await? {
                let id = row.get::<String>(0)?;
                records.push(StoredRecord {
                    source_ref: format!("analysis_records:{}", id),
                    document: row.get::<String>(1)?,
                });
            }
        }

        Ok(records)
    }
}

/// Record store over a directory of `<handle>_<YYYYmmdd_HHMMSS>.json` files
///
/// This is the layout earlier releases wrote; it stays readable so their
/// history reconciles alongside the database.
pub struct JsonDirRecordStore {
    dir: PathBuf,
}

impl JsonDirRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem_for(record: &AnalysisRecord) -> String {
        format!(
            "{}_{}",
            sanitize_file_stem(&record.subject_handle),
            record.timestamp.format(FILE_TIMESTAMP_FORMAT)
        )
    }

    /// Create the record file without replacing an existing one
    ///
    /// A second record for the same handle within the same second falls back
    /// to a name carrying the first eight characters of its id.
    async fn create_record_file(&self, record: &AnalysisRecord) -> Result<(PathBuf, fs::File)> {
        let stem = Self::file_stem_for(record);
        let path = self.dir.join(format!("{}.json", stem));
        match create_new(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{} exists, using id-suffixed name", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        let id = record.id.simple().to_string();
        let path = self.dir.join(format!("{}_{}.json", stem, &id[..8]));
        let file = create_new(&path).await?;
        Ok((path, file))
    }
}

async fn create_new(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

#[async_trait]
impl RecordStore for JsonDirRecordStore {
    async fn append(&self, record: &AnalysisRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(&record_document(record))?;
        let (path, mut file) = self.create_record_file(record).await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;

        debug!("Wrote analysis record {}", path.display());
        Ok(())
    }

    async fn load_all_for_handles(&self, handles: &[String]) -> Result<Vec<StoredRecord>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Record directory {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let prefixes: Vec<String> = handles
            .iter()
            .map(|h| format!("{}_", sanitize_file_stem(h)))
            .collect();

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let matched = prefixes.iter().any(|prefix| {
                stem.strip_prefix(prefix.as_str())
                    .is_some_and(has_timestamp_prefix)
            });
            if matched {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match fs::read_to_string(&path).await {
                Ok(document) => records.push(StoredRecord {
                    source_ref: path.to_string_lossy().into_owned(),
                    document,
                }),
                Err(e) => {
                    let err = CollabError::RecordCorrupt {
                        source_ref: path.to_string_lossy().into_owned(),
                        reason: e.to_string(),
                    };
                    warn!("Skipping unreadable record: {}", err);
                }
            }
        }

        Ok(records)
    }
}

/// Stores the reconciler should read for a storage configuration
///
/// The database table always comes first; the legacy directory follows
/// when configured.
pub fn configured_stores(db: &Database, config: &StorageConfig) -> Vec<Arc<dyn RecordStore>> {
    let mut stores: Vec<Arc<dyn RecordStore>> = vec![Arc::new(LibsqlRecordStore::new(db))];
    if let Some(dir) = &config.legacy_records_dir {
        debug!("Including legacy records from {}", dir.display());
        stores.push(Arc::new(JsonDirRecordStore::new(dir.clone())));
    }
    stores
}

/// `YYYYmmdd_HHMMSS` at the start of a filename remainder
fn has_timestamp_prefix(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    bytes.len() >= 15
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'_'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && (bytes.len() == 15 || bytes[15] == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisFailure, FailureKind, Scores};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(handle: &str, hour: u32) -> AnalysisRecord {
        AnalysisRecord {
            id: Uuid::new_v4(),
            subject_handle: handle.to_string(),
            group: "g1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap(),
            scores: Scores::zeroed(),
            feedback: "steady".to_string(),
            mentions: vec![],
            schema_version: "0.7.0".to_string(),
            registered_identity: Some("alice".to_string()),
            attempts: 1,
            temperature: 0.3,
            error: None,
        }
    }

    #[test]
    fn test_record_document_shape() {
        let mut r = record("wx_1", 9);
        r.error = Some(AnalysisFailure {
            kind: FailureKind::ParseFailure,
            message: "no payload".to_string(),
            raw_excerpt: None,
        });

        let doc = record_document(&r);
        assert_eq!(doc["talker"], "wx_1");
        assert_eq!(doc["group"], "g1");
        assert_eq!(doc["system_id"], "alice");
        assert_eq!(doc["analysis"]["feedback"], "steady");
        assert_eq!(doc["analysis"]["scores"]["participation"], 0.0);
        assert_eq!(doc["analysis"]["error"]["kind"], "parse_failure");
    }

    #[tokio::test]
    async fn test_libsql_store_filters_by_handle() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_local(dir.path().join("records.db")).await.unwrap();
        let store = LibsqlRecordStore::new(&db);

        store.append(&record("wx_1", 9)).await.unwrap();
        store.append(&record("wx_2", 10)).await.unwrap();
        store.append(&record("wx_1", 11)).await.unwrap();

        let loaded = store.load_all_for_handles(&["wx_1".to_string()]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].source_ref.starts_with("analysis_records:"));
        let doc: Value = serde_json::from_str(&loaded[0].document).unwrap();
        assert_eq!(doc["talker"], "wx_1");
    }

    #[tokio::test]
    async fn test_json_dir_store_matches_exact_handle() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirRecordStore::new(dir.path().join("records"));

        store.append(&record("wx_1", 9)).await.unwrap();
        store.append(&record("wx_12", 9)).await.unwrap();
        store.append(&record("wx_1", 9)).await.unwrap();
        std::fs::write(dir.path().join("records").join("wx_1_notes.txt"), "x").unwrap();

        let loaded = store.load_all_for_handles(&["wx_1".to_string()]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|r| r.source_ref.contains("wx_1_20250301_090000")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_json_dir_store_concurrent_appends_keep_both_records() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirRecordStore::new(dir.path().join("records"));
        let first = record("wx_1", 9);
        let second = record("wx_1", 9);

        let (a, b) = tokio::join!(store.append(&first), store.append(&second));
        a.unwrap();
        b.unwrap();

        let loaded = store.load_all_for_handles(&["wx_1".to_string()]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let feedback: Vec<String> = loaded
            .iter()
            .map(|r| {
                let doc: Value = serde_json::from_str(&r.document).unwrap();
                doc["analysis"]["feedback"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(feedback, vec!["steady", "steady"]);
    }

    #[tokio::test]
    async fn test_json_dir_store_never_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        let records = dir.path().join("records");
        std::fs::create_dir_all(&records).unwrap();
        let existing = records.join("wx_1_20250301_090000.json");
        std::fs::write(&existing, r#"{"talker": "wx_1", "analysis": {"feedback": "older"}}"#).unwrap();

        let store = JsonDirRecordStore::new(&records);
        store.append(&record("wx_1", 9)).await.unwrap();

        let kept = std::fs::read_to_string(&existing).unwrap();
        assert!(kept.contains("older"));
        assert_eq!(std::fs::read_dir(&records).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_json_dir_store_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirRecordStore::new(dir.path().join("absent"));
        assert!(store
            .load_all_for_handles(&["wx_1".to_string()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_configured_stores_include_legacy_dir() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_local(dir.path().join("records.db")).await.unwrap();

        let mut config = StorageConfig {
            database_path: dir.path().join("records.db"),
            legacy_records_dir: None,
        };
        assert_eq!(configured_stores(&db, &config).len(), 1);

        let legacy = dir.path().join("legacy");
        JsonDirRecordStore::new(&legacy)
            .append(&record("wx_1", 8))
            .await
            .unwrap();
        config.legacy_records_dir = Some(legacy);

        let stores = configured_stores(&db, &config);
        assert_eq!(stores.len(), 2);
        let loaded = stores[1]
            .load_all_for_handles(&["wx_1".to_string()])
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_timestamp_prefix_detection() {
        assert!(has_timestamp_prefix("20250301_090000"));
        assert!(has_timestamp_prefix("20250301_090000_ab12cd34"));
        assert!(!has_timestamp_prefix("2_20250301_090000"));
        assert!(!has_timestamp_prefix("20250301-090000"));
    }
}
