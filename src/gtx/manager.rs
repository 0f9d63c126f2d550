//! Global Transaction Manager
//!
//! Assigns the global commit order and keeps the persisted descriptor log in
//! step with the in-memory [`TransactionStore`]. Both the active and the
//! passive servers go through this type; only the active hands out new ids.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::descriptor::GlobalTransactionDescriptor;
use super::store::TransactionStore;
use crate::error::Result;
use crate::id::{GlobalTransactionID, GroupID, NodeID, ServerTransactionID};
use crate::persistence::{PersistenceGateway, PersistentSequence, TransactionPersistor, GLOBAL_TXN_SEQUENCE};

/// Ids reserved from the persisted sequence at a time
const GID_BLOCK_SIZE: i64 = 1000;

/// Sequencer and store of global transaction descriptors
pub struct GlobalTransactionManager {
    store: TransactionStore,
    persistor: Arc<dyn TransactionPersistor>,
    sequence: PersistentSequence,
}

impl GlobalTransactionManager {
    pub fn new(gateway: &PersistenceGateway) -> Self {
        Self {
            store: TransactionStore::new(),
            persistor: Arc::clone(&gateway.transactions),
            sequence: PersistentSequence::new(
                GLOBAL_TXN_SEQUENCE,
                Arc::clone(&gateway.sequences),
                GID_BLOCK_SIZE,
            ),
        }
    }

    /// Create a manager and recover every persisted descriptor
    pub async fn load(gateway: &PersistenceGateway) -> Result<Self> {
        let manager = Self::new(gateway);
        let descriptors = manager
            .persistor
            .load_all_global_transaction_descriptors()
            .await?;
        let count = descriptors.len();
        manager.store.load(descriptors).await;

        let max = manager.store.max_global_transaction_id().await;
        if !max.is_null() {
            manager.sequence.advance_to(max.as_i64() + 1).await?;
        }
        info!(descriptors = count, max_gid = %max, "Loaded global transaction descriptors");
        Ok(manager)
    }

    /// True exactly once per server transaction id
    pub async fn start_apply(
        &self,
        sid: &ServerTransactionID,
        proposed: GlobalTransactionID,
        group: GroupID,
    ) -> Result<bool> {
        match self.store.start_apply(sid, proposed, group).await {
            Ok(first) => {
                if !first {
                    debug!(txn = %sid, gid = %proposed, "Transaction already applied, skipping");
                }
                Ok(first)
            }
            Err(e) => {
                warn!(txn = %sid, gid = %proposed, error = %e, "Rejected transaction");
                Err(e)
            }
        }
    }

    /// Give up on transactions whose apply started; only `Applying`
    /// descriptors are dropped
    pub async fn abort_apply(&self, sids: &[ServerTransactionID], group: GroupID) -> usize {
        if sids.is_empty() {
            return 0;
        }
        let aborted = self.store.abort_apply(sids, group).await;
        if !aborted.is_empty() {
            warn!(count = aborted.len(), group = %group, "Aborted transactions before commit");
        }
        aborted.len()
    }

    /// Mark one transaction applied and persist it
    pub async fn commit(&self, sid: &ServerTransactionID, group: GroupID) -> Result<()> {
        let descriptor = self.store.commit(sid, group).await?;
        self.persistor
            .save_global_transaction_descriptors(std::slice::from_ref(&descriptor))
            .await
    }

    /// Mark a batch of transactions applied and persist them in one write
    pub async fn commit_all(&self, sids: &[ServerTransactionID], group: GroupID) -> Result<()> {
        if sids.is_empty() {
            return Ok(());
        }
        let mut descriptors: Vec<GlobalTransactionDescriptor> = Vec::with_capacity(sids.len());
        for sid in sids {
            descriptors.push(self.store.commit(sid, group).await?);
        }
        self.persistor
            .save_global_transaction_descriptors(&descriptors)
            .await?;
        debug!(count = descriptors.len(), group = %group, "Committed transactions");
        Ok(())
    }

    /// Advance the group's low watermark, purging applied descriptors below it
    pub async fn set_low_watermark(&self, gid: GlobalTransactionID, group: GroupID) -> Result<usize> {
        let purged = self.store.clear_below_gid(gid, group).await;
        self.delete_persisted(purged).await
    }

    /// Per-client low watermark on the active
    pub async fn clear_below_server_txn_id(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
    ) -> Result<usize> {
        let purged = self.store.clear_below_server_txn_id(sid, group).await;
        self.delete_persisted(purged).await
    }

    /// Forget a departed node's transactions
    pub async fn shutdown_node(&self, node: &NodeID) -> Result<usize> {
        let purged = self.store.shutdown_node(node).await;
        let count = self.delete_persisted(purged).await?;
        if count > 0 {
            info!(node = %node, descriptors = count, "Removed transactions of departed node");
        }
        Ok(count)
    }

    async fn delete_persisted(&self, purged: Vec<ServerTransactionID>) -> Result<usize> {
        if purged.is_empty() {
            return Ok(0);
        }
        let deleted = self
            .persistor
            .delete_all_global_transaction_descriptors(&purged)
            .await?;
        debug!(purged = purged.len(), deleted, "Purged global transaction descriptors");
        Ok(purged.len())
    }

    /// Global id of `sid`, assigning a fresh one on first sight
    pub async fn get_or_create_global_transaction_id(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
    ) -> Result<GlobalTransactionID> {
        if let Some(descriptor) = self.store.descriptor(sid, group).await {
            return Ok(descriptor.global_txn_id);
        }
        let candidate = GlobalTransactionID(self.sequence.next().await?);
        Ok(self.store.get_or_insert(sid, group, candidate).await)
    }

    pub async fn descriptor(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
    ) -> Option<GlobalTransactionDescriptor> {
        self.store.descriptor(sid, group).await
    }

    pub async fn least_global_transaction_id(&self, group: GroupID) -> GlobalTransactionID {
        self.store.least_global_transaction_id(group).await
    }

    pub async fn low_watermark(&self, group: GroupID) -> GlobalTransactionID {
        self.store.low_watermark(group).await
    }

    pub async fn size(&self) -> usize {
        self.store.size().await
    }

    pub async fn size_for(&self, group: GroupID) -> usize {
        self.store.size_for(group).await
    }
}

impl std::fmt::Debug for GlobalTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTransactionManager")
            .field("sequence", &self.sequence)
            .finish()
    }
}
