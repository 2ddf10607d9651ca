use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StorageError;
use crate::models::RequestStatus;

/// An entity stored as a JSON document, with its status mirrored into an indexed column.
pub trait Document: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    const ENTITY: &'static str;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);

    fn status(&self) -> Option<RequestStatus> {
        None
    }
}

pub struct DbManager {
    conn: Arc<Mutex<Connection>>,
}

impl DbManager {
    pub fn new(db_path: &str) -> Result<Self, StorageError> {
        // ensure directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Corrupt(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        manager.init_schema()?;

        Ok(manager)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        for table in [
            "wallets",
            "internal_wallets",
            "nodes",
            "channels",
            "withdrawal_requests",
            "channel_operation_requests",
            "swap_outs",
        ] {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        status TEXT,
                        body TEXT NOT NULL
                    )",
                    table
                ),
                [],
            )?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS request_psbts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_kind TEXT NOT NULL,
                request_id INTEGER NOT NULL,
                psbt TEXT NOT NULL,
                signer_user_id TEXT,
                is_template INTEGER NOT NULL,
                is_internal_wallet INTEGER NOT NULL,
                is_finalised INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS request_psbts_request ON request_psbts (request_kind, request_id);

            CREATE TABLE IF NOT EXISTS utxos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                txid TEXT NOT NULL,
                output_index INTEGER NOT NULL,
                sats_amount INTEGER NOT NULL,
                address TEXT,
                wallet_id INTEGER NOT NULL,
                UNIQUE (txid, output_index)
            );

            CREATE TABLE IF NOT EXISTS utxo_locks (
                utxo_id INTEGER NOT NULL REFERENCES utxos (id),
                request_kind TEXT NOT NULL,
                request_id INTEGER NOT NULL,
                PRIMARY KEY (utxo_id, request_kind, request_id)
            );

            CREATE TABLE IF NOT EXISTS utxo_tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                outpoint TEXT NOT NULL,
                UNIQUE (key, outpoint)
            );",
        )?;

        Ok(())
    }

    pub fn get_conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Poisoned(e.to_string()))
    }

    pub fn add<T: Document>(&self, doc: &mut T) -> Result<i64, StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            &format!("INSERT INTO {} (status, body) VALUES (?1, '{{}}')", T::TABLE),
            params![doc.status().map(|s| s.as_str())],
        )?;
        let id = conn.last_insert_rowid();
        doc.set_id(id);

        conn.execute(
            &format!("UPDATE {} SET body = ?1 WHERE id = ?2", T::TABLE),
            params![serde_json::to_string(doc)?, id],
        )?;

        tracing::debug!("Stored {} {}", T::ENTITY, id);
        Ok(id)
    }

    pub fn find<T: Document>(&self, id: i64) -> Result<Option<T>, StorageError> {
        let conn = self.get_conn()?;

        let body: Option<String> = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = ?1", T::TABLE),
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub fn get<T: Document>(&self, id: i64) -> Result<T, StorageError> {
        self.find(id)?.ok_or(StorageError::NotFound {
            entity: T::ENTITY,
            id,
        })
    }

    pub fn update<T: Document>(&self, doc: &T) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        let updated = conn.execute(
            &format!("UPDATE {} SET status = ?1, body = ?2 WHERE id = ?3", T::TABLE),
            params![doc.status().map(|s| s.as_str()), serde_json::to_string(doc)?, doc.id()],
        )?;

        if updated == 0 {
            return Err(StorageError::NotFound {
                entity: T::ENTITY,
                id: doc.id(),
            });
        }

        Ok(())
    }

    pub fn list<T: Document>(&self) -> Result<Vec<T>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(&format!("SELECT body FROM {} ORDER BY id", T::TABLE))?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }

    pub fn list_by_status<T: Document>(&self, status: RequestStatus) -> Result<Vec<T>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT body FROM {} WHERE status = ?1 ORDER BY id",
            T::TABLE
        ))?;
        let bodies = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StorageError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Node, RequestStatus, WalletWithdrawalRequest};
    use crate::test_utils;
    use tempfile::tempdir;

    #[test]
    fn test_schema_is_created_on_disk() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("engine.db");

        let db = DbManager::new(db_path.to_str().unwrap()).unwrap();
        assert!(db_path.exists());

        // reopening an existing database keeps the schema
        drop(db);
        let db = DbManager::new(db_path.to_str().unwrap()).unwrap();
        assert!(db.list::<Node>().unwrap().is_empty());
    }

    #[test]
    fn test_add_get_update_document() {
        let db = DbManager::in_memory().unwrap();

        let mut node = test_utils::node("alice");
        let id = db.add(&mut node).unwrap();
        assert_eq!(node.id, id);

        let mut loaded: Node = db.get(id).unwrap();
        assert_eq!(loaded, node);

        loaded.name = "alice-2".to_string();
        db.update(&loaded).unwrap();
        assert_eq!(db.get::<Node>(id).unwrap().name, "alice-2");

        assert!(matches!(
            db.get::<Node>(id + 1),
            Err(StorageError::NotFound { entity: "node", .. })
        ));
    }

    #[test]
    fn test_list_by_status_follows_updates() {
        let db = DbManager::in_memory().unwrap();

        let mut request = test_utils::withdrawal_request(1, "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080", 10_000);
        db.add(&mut request).unwrap();
        assert_eq!(db.list_by_status::<WalletWithdrawalRequest>(RequestStatus::Pending).unwrap().len(), 1);

        request.status = RequestStatus::Failed;
        db.update(&request).unwrap();
        assert!(db.list_by_status::<WalletWithdrawalRequest>(RequestStatus::Pending).unwrap().is_empty());
        assert_eq!(db.list_by_status::<WalletWithdrawalRequest>(RequestStatus::Failed).unwrap().len(), 1);
    }
}
