//! In-memory persistor, for non-persistent servers and tests

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::{ClientStatePersistor, SequencePersistor, TransactionPersistor};
use crate::error::{Error, Result};
use crate::gtx::GlobalTransactionDescriptor;
use crate::id::{ClientID, ServerTransactionID};

#[derive(Debug, Default)]
struct Tables {
    descriptors: BTreeMap<ServerTransactionID, GlobalTransactionDescriptor>,
    clients: BTreeSet<ClientID>,
    sequences: BTreeMap<String, i64>,
}

/// Persistor that keeps everything in process memory
#[derive(Debug, Default)]
pub struct MemoryPersistor {
    tables: Mutex<Tables>,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Persistence("memory persistor lock poisoned".into()))
    }
}

#[async_trait]
impl TransactionPersistor for MemoryPersistor {
    async fn load_all_global_transaction_descriptors(&self) -> Result<Vec<GlobalTransactionDescriptor>> {
        let tables = self.tables()?;
        let mut all: Vec<_> = tables.descriptors.values().cloned().collect();
        all.sort_by_key(|d| d.global_txn_id);
        Ok(all)
    }

    async fn save_global_transaction_descriptors(
        &self,
        descriptors: &[GlobalTransactionDescriptor],
    ) -> Result<()> {
        let mut tables = self.tables()?;
        for d in descriptors {
            tables.descriptors.insert(d.server_txn_id.clone(), d.clone());
        }
        Ok(())
    }

    async fn delete_all_global_transaction_descriptors(
        &self,
        ids: &[ServerTransactionID],
    ) -> Result<u64> {
        let mut tables = self.tables()?;
        Ok(ids
            .iter()
            .filter(|id| tables.descriptors.remove(*id).is_some())
            .count() as u64)
    }
}

#[async_trait]
impl ClientStatePersistor for MemoryPersistor {
    async fn loaded_client_ids(&self) -> Result<Vec<ClientID>> {
        Ok(self.tables()?.clients.iter().copied().collect())
    }

    async fn contains_client(&self, client: ClientID) -> Result<bool> {
        Ok(self.tables()?.clients.contains(&client))
    }

    async fn save_client_state(&self, client: ClientID) -> Result<()> {
        self.tables()?.clients.insert(client);
        Ok(())
    }

    async fn delete_client_state(&self, client: ClientID) -> Result<()> {
        self.tables()?.clients.remove(&client);
        Ok(())
    }
}

#[async_trait]
impl SequencePersistor for MemoryPersistor {
    async fn reserve(&self, name: &str, count: i64) -> Result<(i64, i64)> {
        if count <= 0 {
            return Err(Error::Persistence(format!(
                "cannot reserve {} values of sequence {}",
                count, name
            )));
        }
        let mut tables = self.tables()?;
        let next = tables.sequences.entry(name.to_string()).or_insert(1);
        let start = *next;
        *next += count;
        Ok((start, *next))
    }

    async fn set_min_next(&self, name: &str, value: i64) -> Result<()> {
        let mut tables = self.tables()?;
        let next = tables.sequences.entry(name.to_string()).or_insert(1);
        *next = (*next).max(value);
        Ok(())
    }

    async fn peek(&self, name: &str) -> Result<i64> {
        Ok(self.tables()?.sequences.get(name).copied().unwrap_or(1))
    }
}
