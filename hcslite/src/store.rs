//! Keyed document store for persisted container state.
//!
//! The runtime persists per-container documents under (container id, key).
//! The store itself is a collaborator: the runtime only consumes
//! [`StateStore`], and the bundled implementation keeps the documents in a
//! sqlite database under the data directory.

use std::path::Path;

use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

/// Keyed document store indexed by container id.
pub trait StateStore: Send + Sync {
    fn put(&self, container_id: &str, key: &str, value: &Value) -> HcsliteResult<()>;
    fn get(&self, container_id: &str, key: &str) -> HcsliteResult<Option<Value>>;
    fn delete(&self, container_id: &str, key: &str) -> HcsliteResult<()>;
    /// Remove every document for a container.
    fn delete_all(&self, container_id: &str) -> HcsliteResult<()>;
    /// All container ids known to this host.
    fn list_ids(&self) -> HcsliteResult<Vec<String>>;
    /// All keys stored for one container.
    fn keys(&self, container_id: &str) -> HcsliteResult<Vec<String>>;
}

/// Sqlite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> HcsliteResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HcsliteError::Storage(format!("creating {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| HcsliteError::Storage(format!("opening {}: {}", path.display(), e)))?;
        Self::init(conn)
    }

    /// An ephemeral store, used by tests.
    pub fn in_memory() -> HcsliteResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> HcsliteResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                container_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (container_id, key)
            );",
        )
        .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StateStore for SqliteStore {
    fn put(&self, container_id: &str, key: &str, value: &Value) -> HcsliteResult<()> {
        let raw = serde_json::to_string(value)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO documents (container_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (container_id, key) DO UPDATE SET value = excluded.value",
                params![container_id, key, raw],
            )
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Ok(())
    }

    fn get(&self, container_id: &str, key: &str) -> HcsliteResult<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM documents WHERE container_id = ?1 AND key = ?2",
                params![container_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, container_id: &str, key: &str) -> HcsliteResult<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM documents WHERE container_id = ?1 AND key = ?2",
                params![container_id, key],
            )
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete_all(&self, container_id: &str) -> HcsliteResult<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM documents WHERE container_id = ?1",
                params![container_id],
            )
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Ok(())
    }

    fn list_ids(&self) -> HcsliteResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT container_id FROM documents ORDER BY container_id")
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| HcsliteError::Storage(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Ok(ids)
    }

    fn keys(&self, container_id: &str) -> HcsliteResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key FROM documents WHERE container_id = ?1 ORDER BY key")
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        let keys = stmt
            .query_map(params![container_id], |row| row.get::<_, String>(0))
            .map_err(|e| HcsliteError::Storage(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HcsliteError::Storage(e.to_string()))?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_roundtrip_and_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("c1", "state", &json!({"pid": 1})).unwrap();
        store.put("c1", "state", &json!({"pid": 2})).unwrap();

        assert_eq!(store.get("c1", "state").unwrap(), Some(json!({"pid": 2})));
        assert_eq!(store.get("c1", "missing").unwrap(), None);
        assert_eq!(store.get("ghost", "state").unwrap(), None);
    }

    #[test]
    fn enumeration_by_id_and_key() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("a", "state", &json!(1)).unwrap();
        store.put("a", "shim", &json!(100)).unwrap();
        store.put("b", "state", &json!(2)).unwrap();

        assert_eq!(store.list_ids().unwrap(), vec!["a", "b"]);
        assert_eq!(store.keys("a").unwrap(), vec!["shim", "state"]);
    }

    #[test]
    fn delete_all_removes_the_container() {
        let store = SqliteStore::in_memory().unwrap();
        store.put("a", "state", &json!(1)).unwrap();
        store.put("a", "mount", &json!(true)).unwrap();
        store.put("b", "state", &json!(2)).unwrap();

        store.delete_all("a").unwrap();
        assert_eq!(store.list_ids().unwrap(), vec!["b"]);
        assert_eq!(store.get("a", "state").unwrap(), None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("c", "state", &json!({"ok": true})).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("c", "state").unwrap(), Some(json!({"ok": true})));
    }
}
