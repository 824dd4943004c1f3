use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("Cannot open metadata store: {raw_error_message:?}")]
    CannotOpen { raw_error_message: String },

    #[error("Metadata store query failed: {raw_error_message:?}")]
    QueryFailed { raw_error_message: String },

    #[error("Metadata record is not valid JSON: {raw_error_message:?}")]
    InvalidRecord { raw_error_message: String },
}

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        KvError::QueryFailed {
            raw_error_message: e.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KvRecord {
    pub id: String,
    pub body: serde_json::Value,
    pub etag: String,
    pub ts: f64,
}

/// Embedded per-collection metadata store.
///
/// Every write stamps a fresh opaque etag; the caller gets its
/// compare-and-swap semantics by reading and writing inside one
/// transaction. The connection mutex plus the SQLite file lock serialize
/// writers.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    pub fn open(path: &Path) -> Result<KvStore, KvError> {
        let conn = Connection::open(path).map_err(|e| KvError::CannotOpen {
            raw_error_message: e.to_string(),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                store TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                etag TEXT NOT NULL,
                ts REAL NOT NULL,
                PRIMARY KEY (store, id)
            )",
            [],
        )?;
        Ok(KvStore {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one SQLite transaction. The error type only needs a
    /// `From<KvError>` conversion so domain errors cross the boundary
    /// unchanged.
    pub fn transaction<T, E: From<KvError>>(
        &self,
        f: impl FnOnce(&mut KvTransaction) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut conn = self.conn.lock().expect("kv store mutex poisoned");
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| E::from(KvError::from(e)))?;
        let mut kv_tx = KvTransaction { tx: &tx };
        let result = f(&mut kv_tx)?;
        tx.commit().map_err(|e| E::from(KvError::from(e)))?;
        Ok(result)
    }

    pub fn get(&self, store: &str, id: &str) -> Result<Option<KvRecord>, KvError> {
        self.transaction::<_, KvError>(|tx| tx.get(store, id))
    }

    pub fn put(&self, store: &str, id: &str, body: &serde_json::Value) -> Result<KvRecord, KvError> {
        self.transaction::<_, KvError>(|tx| tx.put(store, id, body))
    }

    pub fn delete(&self, store: &str, id: &str) -> Result<bool, KvError> {
        self.transaction::<_, KvError>(|tx| tx.delete(store, id))
    }

    pub fn list(
        &self,
        store: &str,
        id_prefix: Option<&str>,
        id_gt: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<KvRecord>, KvError> {
        self.transaction::<_, KvError>(|tx| tx.list(store, id_prefix, id_gt, limit))
    }
}

pub struct KvTransaction<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl KvTransaction<'_> {
    pub fn get(&self, store: &str, id: &str) -> Result<Option<KvRecord>, KvError> {
        let row = self
            .tx
            .query_row(
                "SELECT id, body, etag, ts FROM records WHERE store = ?1 AND id = ?2",
                params![store, id],
                row_to_raw,
            )
            .optional()?;
        row.map(raw_to_record).transpose()
    }

    pub fn put(&self, store: &str, id: &str, body: &serde_json::Value) -> Result<KvRecord, KvError> {
        let etag = Uuid::new_v4().to_string();
        let ts = now_epoch();
        let body_text = body.to_string();
        self.tx.execute(
            "INSERT INTO records (store, id, body, etag, ts) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (store, id) DO UPDATE SET body = ?3, etag = ?4, ts = ?5",
            params![store, id, body_text, etag, ts],
        )?;
        Ok(KvRecord {
            id: id.to_string(),
            body: body.clone(),
            etag,
            ts,
        })
    }

    pub fn delete(&self, store: &str, id: &str) -> Result<bool, KvError> {
        let deleted = self
            .tx
            .execute("DELETE FROM records WHERE store = ?1 AND id = ?2", params![store, id])?;
        Ok(deleted > 0)
    }

    /// Records in ascending binary id order, optionally bounded by a prefix
    /// and an exclusive lower bound.
    pub fn list(
        &self,
        store: &str,
        id_prefix: Option<&str>,
        id_gt: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Vec<KvRecord>, KvError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.tx.prepare(
            "SELECT id, body, etag, ts FROM records
             WHERE store = ?1
               AND (?2 IS NULL OR substr(id, 1, length(?2)) = ?2)
               AND (?3 IS NULL OR id > ?3)
             ORDER BY id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![store, id_prefix, id_gt, limit], row_to_raw)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(raw_to_record(row?)?);
        }
        Ok(records)
    }
}

type RawRecord = (String, String, String, f64);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn raw_to_record((id, body, etag, ts): RawRecord) -> Result<KvRecord, KvError> {
    let body = serde_json::from_str(&body).map_err(|e| KvError::InvalidRecord {
        raw_error_message: e.to_string(),
    })?;
    Ok(KvRecord { id, body, etag, ts })
}

pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_store() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(&dir.path().join("__db")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_stamps_a_fresh_etag_every_time() {
        let (_dir, store) = scratch_store();
        let first = store.put("object", "a", &json!({"n": 1})).unwrap();
        let second = store.put("object", "a", &json!({"n": 2})).unwrap();
        assert_ne!(first.etag, second.etag);
        let read = store.get("object", "a").unwrap().unwrap();
        assert_eq!(read.etag, second.etag);
        assert_eq!(read.body, json!({"n": 2}));
    }

    #[test]
    fn list_orders_by_id_with_prefix_and_bound() {
        let (_dir, store) = scratch_store();
        for id in ["b", "a", "ab", "zz", "aa"] {
            store.put("object", id, &json!({})).unwrap();
        }
        let all = store.list("object", None, None, None).unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "aa", "ab", "b", "zz"]);

        let prefixed = store.list("object", Some("a"), None, None).unwrap();
        let ids: Vec<&str> = prefixed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "aa", "ab"]);

        let bounded = store.list("object", Some("a"), Some("a"), Some(1)).unwrap();
        let ids: Vec<&str> = bounded.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["aa"]);
    }

    #[test]
    fn transaction_groups_writes() {
        let (_dir, store) = scratch_store();
        let result: Result<(), KvError> = store.transaction(|tx| {
            tx.put("object", "head", &json!({"v": "1"}))?;
            tx.put("object", "version-1", &json!({"v": "1"}))?;
            Ok(())
        });
        assert!(result.is_ok());
        assert!(store.get("object", "head").unwrap().is_some());
        assert!(store.get("object", "version-1").unwrap().is_some());
    }

    #[test]
    fn delete_reports_missing_rows() {
        let (_dir, store) = scratch_store();
        store.put("object", "a", &json!({})).unwrap();
        assert!(store.delete("object", "a").unwrap());
        assert!(!store.delete("object", "a").unwrap());
    }
}
