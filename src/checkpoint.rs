//! Checkpoint store.
//!
//! Durable mapping `(begin_hex, num) → (owner, height)`, compacting proof
//! chains by recording "Value V was legitimately owned by address A at block
//! h".

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, StorageError};
use crate::value::Value;

/// One durable checkpoint record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// `begin` of the checkpointed range, as `0x`-prefixed hex.
    pub begin_hex: String,
    /// `num` of the checkpointed range.
    pub num: String,
    /// Address that last legitimately held this exact range.
    pub owner: String,
    /// Block height at which ownership of this exact range ended.
    pub height: u64,
    /// When this record was first created.
    pub created_at: DateTime<Utc>,
    /// When this record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Whether this record's range fully encloses `value`'s range.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        let Ok(begin) = num_bigint::BigUint::parse_bytes(self.begin_hex.trim_start_matches("0x").as_bytes(), 16).ok_or(()) else {
            return false;
        };
        let Ok(num) = self.num.parse::<num_bigint::BigUint>() else {
            return false;
        };
        let end = &begin + &num - num_bigint::BigUint::from(1u32);
        value.begin() >= &begin && value.end() <= end
    }
}

/// Container export format: `{ export_time, total, checkpoints }`.
#[derive(Serialize, Deserialize)]
struct Export {
    export_time: DateTime<Utc>,
    total: usize,
    checkpoints: Vec<CheckpointRecord>,
}

/// Durable, cached mapping from an exact Value range to its last-known
/// legitimate owner and height.
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
    cache: Mutex<std::collections::HashMap<(String, String), CheckpointRecord>>,
}

impl CheckpointStore {
    /// Opens (creating if absent) the checkpoint database at `path`.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                begin_hex TEXT NOT NULL,
                num TEXT NOT NULL,
                owner TEXT NOT NULL,
                height INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(begin_hex, num)
             );
             CREATE INDEX IF NOT EXISTS idx_checkpoints_owner ON checkpoints(owner);
             CREATE INDEX IF NOT EXISTS idx_checkpoints_height ON checkpoints(height);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cache: Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn key(value: &Value) -> (String, String) {
        (value.begin_hex(), value.num().to_string())
    }

    /// Creates a checkpoint for `value` owned by `owner` as of `height`.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateCheckpoint`] if an exact-range record
    /// already exists.
    pub fn create(&self, value: &Value, owner: &str, height: u64) -> Result<CheckpointRecord, Error> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let result = conn.execute(
            "INSERT INTO checkpoints (begin_hex, num, owner, height, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![value.begin_hex(), value.num().to_string(), owner, height, now.to_rfc3339()],
        );
        match result {
            Ok(_) => {
                let record = CheckpointRecord {
                    begin_hex: value.begin_hex(),
                    num: value.num().to_string(),
                    owner: owner.to_owned(),
                    height,
                    created_at: now,
                    updated_at: now,
                };
                self.cache.lock().insert(Self::key(value), record.clone());
                Ok(record)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(Error::DuplicateCheckpoint)
            }
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    /// Updates the exact-range record for `value` to `new_owner`/`new_h`,
    /// preserving `created_at`.
    ///
    /// # Errors
    /// Returns [`Error::CheckpointNotFound`] if no exact match exists.
    pub fn update(&self, value: &Value, new_owner: &str, new_height: u64) -> Result<CheckpointRecord, Error> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let rows = conn
            .execute(
                "UPDATE checkpoints SET owner = ?1, height = ?2, updated_at = ?3 WHERE begin_hex = ?4 AND num = ?5",
                params![new_owner, new_height, now.to_rfc3339(), value.begin_hex(), value.num().to_string()],
            )
            .map_err(StorageError::from)?;
        if rows == 0 {
            return Err(Error::CheckpointNotFound);
        }
        self.cache.lock().remove(&Self::key(value));
        self.get(value)?.ok_or(Error::CheckpointNotFound)
    }

    /// Exact-match lookup by `(begin, num)`.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on durable I/O failure.
    pub fn get(&self, value: &Value) -> Result<Option<CheckpointRecord>, Error> {
        if let Some(cached) = self.cache.lock().get(&Self::key(value)) {
            return Ok(Some(cached.clone()));
        }
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT begin_hex, num, owner, height, created_at, updated_at FROM checkpoints
                 WHERE begin_hex = ?1 AND num = ?2",
                params![value.begin_hex(), value.num().to_string()],
                Self::row_to_record,
            )
            .optional()
            .map_err(StorageError::from)?;
        if let Some(r) = &record {
            self.cache.lock().insert(Self::key(value), r.clone());
        }
        Ok(record)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRecord> {
        let created_at: String = row.get(4)?;
        let updated_at: String = row.get(5)?;
        Ok(CheckpointRecord {
            begin_hex: row.get(0)?,
            num: row.get(1)?,
            owner: row.get(2)?,
            height: row.get::<_, i64>(3)? as u64,
            created_at: DateTime::parse_from_rfc3339(&created_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        })
    }

    /// Returns the tightest record whose range encloses `value`'s range,
    /// scanning in `height DESC` order. Falls back to the exact match when
    /// present.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on durable I/O failure.
    pub fn find_containing(&self, value: &Value) -> Result<Option<CheckpointRecord>, Error> {
        if let Some(exact) = self.get(value)? {
            return Ok(Some(exact));
        }
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT begin_hex, num, owner, height, created_at, updated_at FROM checkpoints ORDER BY height DESC")
            .map_err(StorageError::from)?;
        let mut rows = stmt.query_map([], Self::row_to_record).map_err(StorageError::from)?;
        while let Some(row) = rows.next() {
            let record = row.map_err(StorageError::from)?;
            if record.contains(value) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Returns the containing record iff its owner is `expected_owner`; the
    /// oracle the validator's stage 2 uses to decide whether a checkpoint
    /// applies.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on durable I/O failure.
    pub fn trigger_verification(&self, value: &Value, expected_owner: &str) -> Result<Option<CheckpointRecord>, Error> {
        Ok(self.find_containing(value)?.filter(|r| r.owner == expected_owner))
    }

    /// All records owned by `owner`.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on durable I/O failure.
    pub fn find_by_owner(&self, owner: &str) -> Result<Vec<CheckpointRecord>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT begin_hex, num, owner, height, created_at, updated_at FROM checkpoints WHERE owner = ?1")
            .map_err(StorageError::from)?;
        let rows = stmt.query_map(params![owner], Self::row_to_record).map_err(StorageError::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| StorageError::from(e).into())
    }

    /// Every record in the store.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on durable I/O failure.
    pub fn list_all(&self) -> Result<Vec<CheckpointRecord>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT begin_hex, num, owner, height, created_at, updated_at FROM checkpoints")
            .map_err(StorageError::from)?;
        let rows = stmt.query_map([], Self::row_to_record).map_err(StorageError::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|e| StorageError::from(e).into())
    }

    /// Deletes the exact-range record for `value`, invalidating the cache entry.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on durable I/O failure.
    pub fn delete(&self, value: &Value) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM checkpoints WHERE begin_hex = ?1 AND num = ?2",
            params![value.begin_hex(), value.num().to_string()],
        )
        .map_err(StorageError::from)?;
        self.cache.lock().remove(&Self::key(value));
        Ok(())
    }

    /// Writes every record as JSON: `{ export_time, total, checkpoints }`.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on I/O or serialization failure.
    pub fn export(&self, path: &Path) -> Result<(), Error> {
        let checkpoints = self.list_all()?;
        let doc = Export {
            export_time: Utc::now(),
            total: checkpoints.len(),
            checkpoints,
        };
        let json = serde_json::to_string_pretty(&doc).map_err(StorageError::from)?;
        std::fs::write(path, json).map_err(StorageError::from)?;
        Ok(())
    }

    /// Imports records from a JSON export. When `overwrite` is `false`,
    /// records whose exact range already exists are skipped.
    ///
    /// # Errors
    /// Returns [`Error::Storage`] on I/O, parse, or durable write failure.
    pub fn import(&self, path: &Path, overwrite: bool) -> Result<usize, Error> {
        let json = std::fs::read_to_string(path).map_err(StorageError::from)?;
        let doc: Export = serde_json::from_str(&json).map_err(StorageError::from)?;
        let mut imported = 0;
        for record in doc.checkpoints {
            let conn = self.conn.lock();
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM checkpoints WHERE begin_hex = ?1 AND num = ?2",
                    params![record.begin_hex, record.num],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(StorageError::from)?
                > 0;
            if exists && !overwrite {
                continue;
            }
            conn.execute(
                "INSERT INTO checkpoints (begin_hex, num, owner, height, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(begin_hex, num) DO UPDATE SET owner = excluded.owner, height = excluded.height, updated_at = excluded.updated_at",
                params![
                    record.begin_hex,
                    record.num,
                    record.owner,
                    record.height,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339()
                ],
            )
            .map_err(StorageError::from)?;
            drop(conn);
            self.cache.lock().remove(&(record.begin_hex.clone(), record.num.clone()));
            imported += 1;
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueState;

    fn store() -> CheckpointStore {
        CheckpointStore::open(Path::new(":memory:")).expect("open")
    }

    fn value(begin: &str, num: u32) -> Value {
        Value::new(begin, num as i128, ValueState::Unspent).expect("value")
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = store();
        let v = value("0x1000", 100);
        store.create(&v, "0xalice", 57).expect("create");
        let record = store.get(&v).expect("get").expect("present");
        assert_eq!(record.owner, "0xalice");
        assert_eq!(record.height, 57);
    }

    #[test]
    fn duplicate_create_rejected() {
        let store = store();
        let v = value("0x1000", 100);
        store.create(&v, "0xalice", 57).expect("create");
        assert!(matches!(store.create(&v, "0xbob", 99), Err(Error::DuplicateCheckpoint)));
    }

    #[test]
    fn update_preserves_created_at() {
        let store = store();
        let v = value("0x1000", 100);
        let created = store.create(&v, "0xalice", 57).expect("create");
        let updated = store.update(&v, "0xbob", 90).expect("update");
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.owner, "0xbob");
    }

    #[test]
    fn update_missing_record_errors() {
        let store = store();
        let v = value("0x1000", 100);
        assert!(matches!(store.update(&v, "0xbob", 90), Err(Error::CheckpointNotFound)));
    }

    #[test]
    fn find_containing_after_split() {
        let store = store();
        let parent = value("0x1000", 100);
        store.create(&parent, "0xalice", 50).expect("create");
        let child = value("0x1020", 30);
        let found = store.find_containing(&child).expect("find").expect("present");
        assert_eq!(found.owner, "0xalice");
    }

    #[test]
    fn trigger_verification_checks_owner() {
        let store = store();
        let v = value("0x1000", 100);
        store.create(&v, "0xalice", 50).expect("create");
        assert!(store.trigger_verification(&v, "0xbob").expect("query").is_none());
        assert!(store.trigger_verification(&v, "0xalice").expect("query").is_some());
    }

    #[test]
    fn delete_invalidates_cache() {
        let store = store();
        let v = value("0x1000", 100);
        store.create(&v, "0xalice", 50).expect("create");
        store.delete(&v).expect("delete");
        assert!(store.get(&v).expect("get").is_none());
    }

    #[test]
    fn export_then_import_round_trips() {
        let store = store();
        let v = value("0x1000", 100);
        store.create(&v, "0xalice", 50).expect("create");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoints.json");
        store.export(&path).expect("export");

        let fresh = store();
        let imported = fresh.import(&path, false).expect("import");
        assert_eq!(imported, 1);
        assert_eq!(fresh.get(&v).expect("get").expect("present").owner, "0xalice");
    }
}
