//! SQLite Persistor
//!
//! Embedded storage for descriptors, client state and sequences.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{ClientStatePersistor, SequencePersistor, TransactionPersistor};
use crate::error::{Error, Result};
use crate::gtx::{DescriptorState, GlobalTransactionDescriptor};
use crate::id::{ClientID, GlobalTransactionID, GroupID, NodeID, ServerTransactionID, TransactionID};

/// Persistor backed by SQLite
pub struct SqlitePersistor {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database file
    path: PathBuf,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl SqlitePersistor {
    /// Create or open the database under `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Self::open(&data_dir.join("dso.db"))
    }

    /// Open a database file directly
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Initialize schema
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS global_transactions (
                source TEXT NOT NULL,
                txn_id INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (source, txn_id)
            );

            CREATE INDEX IF NOT EXISTS idx_global_transactions_gid
                ON global_transactions(gid);

            CREATE TABLE IF NOT EXISTS client_states (
                client_id INTEGER PRIMARY KEY,
                saved_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sequences (
                name TEXT PRIMARY KEY,
                next_value INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Count of stored descriptors
    pub async fn descriptor_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM global_transactions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Every sequence with its next value
    pub async fn all_sequences(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name, next_value FROM sequences ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut sequences = Vec::new();
        for result in rows {
            sequences.push(result?);
        }
        Ok(sequences)
    }
}

fn descriptor_from_row(
    source: String,
    txn_id: i64,
    gid: i64,
    group_id: i64,
    state: String,
) -> Result<GlobalTransactionDescriptor> {
    let node = NodeID::from_key(&source)
        .ok_or_else(|| Error::State(format!("corrupt descriptor source '{}'", source)))?;
    let group = u32::try_from(group_id)
        .map_err(|_| Error::State(format!("corrupt descriptor group {}", group_id)))?;
    Ok(GlobalTransactionDescriptor {
        server_txn_id: ServerTransactionID::new(node, TransactionID(txn_id)),
        global_txn_id: GlobalTransactionID(gid),
        group: GroupID(group),
        state: DescriptorState::parse(&state)?,
    })
}

#[async_trait]
impl TransactionPersistor for SqlitePersistor {
    async fn load_all_global_transaction_descriptors(&self) -> Result<Vec<GlobalTransactionDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT source, txn_id, gid, group_id, state FROM global_transactions ORDER BY gid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut descriptors = Vec::new();
        for result in rows {
            let (source, txn_id, gid, group_id, state) = result?;
            descriptors.push(descriptor_from_row(source, txn_id, gid, group_id, state)?);
        }
        Ok(descriptors)
    }

    async fn save_global_transaction_descriptors(
        &self,
        descriptors: &[GlobalTransactionDescriptor],
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO global_transactions (source, txn_id, gid, group_id, state, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(source, txn_id) DO UPDATE SET
                    gid = ?3,
                    group_id = ?4,
                    state = ?5,
                    updated_at = ?6
                "#,
            )?;
            let ts = now();
            for d in descriptors {
                stmt.execute(params![
                    d.server_txn_id.source.to_key(),
                    d.server_txn_id.txn.as_i64(),
                    d.global_txn_id.as_i64(),
                    d.group.0 as i64,
                    d.state.as_str(),
                    ts,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_all_global_transaction_descriptors(
        &self,
        ids: &[ServerTransactionID],
    ) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut deleted = 0u64;
        {
            let mut stmt =
                tx.prepare("DELETE FROM global_transactions WHERE source = ?1 AND txn_id = ?2")?;
            for id in ids {
                deleted += stmt.execute(params![id.source.to_key(), id.txn.as_i64()])? as u64;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }
}

#[async_trait]
impl ClientStatePersistor for SqlitePersistor {
    async fn loaded_client_ids(&self) -> Result<Vec<ClientID>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT client_id FROM client_states ORDER BY client_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut clients = Vec::new();
        for result in rows {
            clients.push(ClientID(result? as u64));
        }
        Ok(clients)
    }

    async fn contains_client(&self, client: ClientID) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM client_states WHERE client_id = ?1",
            params![client.0 as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn save_client_state(&self, client: ClientID) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO client_states (client_id, saved_at) VALUES (?1, ?2)
            ON CONFLICT(client_id) DO UPDATE SET saved_at = ?2
            "#,
            params![client.0 as i64, now()],
        )?;
        Ok(())
    }

    async fn delete_client_state(&self, client: ClientID) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM client_states WHERE client_id = ?1",
            params![client.0 as i64],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SequencePersistor for SqlitePersistor {
    async fn reserve(&self, name: &str, count: i64) -> Result<(i64, i64)> {
        if count <= 0 {
            return Err(Error::Persistence(format!(
                "cannot reserve {} values of sequence {}",
                count, name
            )));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let start: i64 = tx
            .query_row(
                "SELECT next_value FROM sequences WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(1);
        let end = start + count;
        tx.execute(
            r#"
            INSERT INTO sequences (name, next_value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET next_value = ?2, updated_at = ?3
            "#,
            params![name, end, now()],
        )?;
        tx.commit()?;
        Ok((start, end))
    }

    async fn set_min_next(&self, name: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sequences (name, next_value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                next_value = MAX(next_value, ?2),
                updated_at = ?3
            "#,
            params![name, value, now()],
        )?;
        Ok(())
    }

    async fn peek(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT next_value FROM sequences WHERE name = ?1",
            params![name],
            |row| row.get(0),
        );

        match result {
            Ok(next) => Ok(next),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(1),
            Err(e) => Err(Error::State(format!("Failed to read sequence {}: {}", name, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ServerID;
    use tempfile::tempdir;

    fn descriptor(client: u64, txn: i64, gid: i64) -> GlobalTransactionDescriptor {
        GlobalTransactionDescriptor::new(
            ServerTransactionID::new(ClientID(client), TransactionID(txn)),
            GlobalTransactionID(gid),
            GroupID(0),
        )
    }

    #[tokio::test]
    async fn test_descriptors_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = SqlitePersistor::new(dir.path()).unwrap();
            let mut d1 = descriptor(1, 1, 10);
            let d2 = descriptor(1, 2, 11);
            let d3 = GlobalTransactionDescriptor::new(
                ServerTransactionID::new(NodeID::Server(ServerID("l2-b".into())), TransactionID(4)),
                GlobalTransactionID(12),
                GroupID(0),
            );
            db.save_global_transaction_descriptors(&[d1.clone(), d2, d3]).await.unwrap();

            d1.mark_applied();
            db.save_global_transaction_descriptors(&[d1]).await.unwrap();
        }

        let db = SqlitePersistor::new(dir.path()).unwrap();
        let loaded = db.load_all_global_transaction_descriptors().await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].global_txn_id, GlobalTransactionID(10));
        assert!(loaded[0].is_applied());
        assert!(!loaded[1].is_applied());
        assert_eq!(
            loaded[2].server_txn_id.source,
            NodeID::Server(ServerID("l2-b".into()))
        );

        let deleted = db
            .delete_all_global_transaction_descriptors(&[
                loaded[0].server_txn_id.clone(),
                ServerTransactionID::new(ClientID(99), TransactionID(1)),
            ])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.descriptor_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_client_states() {
        let dir = tempdir().unwrap();
        let db = SqlitePersistor::new(dir.path()).unwrap();

        assert!(db.loaded_client_ids().await.unwrap().is_empty());
        db.save_client_state(ClientID(3)).await.unwrap();
        db.save_client_state(ClientID(1)).await.unwrap();
        db.save_client_state(ClientID(3)).await.unwrap();
        assert_eq!(db.loaded_client_ids().await.unwrap(), vec![ClientID(1), ClientID(3)]);
        assert!(db.contains_client(ClientID(1)).await.unwrap());

        db.delete_client_state(ClientID(1)).await.unwrap();
        assert!(!db.contains_client(ClientID(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sequences() {
        let dir = tempdir().unwrap();
        let db = SqlitePersistor::new(dir.path()).unwrap();

        assert_eq!(db.peek("gid").await.unwrap(), 1);
        assert_eq!(db.reserve("gid", 100).await.unwrap(), (1, 101));
        assert_eq!(db.reserve("gid", 10).await.unwrap(), (101, 111));

        db.set_min_next("gid", 50).await.unwrap();
        assert_eq!(db.peek("gid").await.unwrap(), 111);
        db.set_min_next("gid", 500).await.unwrap();
        assert_eq!(db.reserve("gid", 1).await.unwrap(), (500, 501));

        assert!(db.reserve("gid", 0).await.is_err());
        assert_eq!(db.all_sequences().await.unwrap(), vec![("gid".to_string(), 501)]);
    }
}
