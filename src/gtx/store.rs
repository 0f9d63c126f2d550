//! In-memory transaction store
//!
//! Tracks one [`GlobalTransactionDescriptor`] per server transaction id, per
//! replication group. Each group has its own low watermark and its own lock,
//! so groups never contend with each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::descriptor::GlobalTransactionDescriptor;
use crate::error::{Error, Result};
use crate::id::{GlobalTransactionID, GroupID, NodeID, ServerTransactionID};

#[derive(Debug)]
struct GroupState {
    by_sid: HashMap<ServerTransactionID, GlobalTransactionDescriptor>,
    by_gid: BTreeMap<GlobalTransactionID, ServerTransactionID>,
    low_watermark: GlobalTransactionID,
}

impl GroupState {
    fn new() -> Self {
        Self {
            by_sid: HashMap::new(),
            by_gid: BTreeMap::new(),
            low_watermark: GlobalTransactionID::NULL_ID,
        }
    }

    fn insert(&mut self, descriptor: GlobalTransactionDescriptor) {
        if !descriptor.global_txn_id.is_null() {
            self.by_gid
                .insert(descriptor.global_txn_id, descriptor.server_txn_id.clone());
        }
        self.by_sid.insert(descriptor.server_txn_id.clone(), descriptor);
    }

    fn remove(&mut self, sid: &ServerTransactionID) -> Option<GlobalTransactionDescriptor> {
        let removed = self.by_sid.remove(sid)?;
        self.by_gid.remove(&removed.global_txn_id);
        Some(removed)
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> Vec<ServerTransactionID>
    where
        F: FnMut(&GlobalTransactionDescriptor) -> bool,
    {
        let doomed: Vec<ServerTransactionID> = self
            .by_sid
            .values()
            .filter(|d| predicate(d))
            .map(|d| d.server_txn_id.clone())
            .collect();
        for sid in &doomed {
            self.remove(sid);
        }
        doomed
    }
}

/// Descriptor bookkeeping for every group this server takes part in
#[derive(Debug, Default)]
pub struct TransactionStore {
    groups: RwLock<HashMap<GroupID, Arc<Mutex<GroupState>>>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn group(&self, group: GroupID) -> Arc<Mutex<GroupState>> {
        if let Some(state) = self.groups.read().await.get(&group) {
            return Arc::clone(state);
        }
        let mut groups = self.groups.write().await;
        Arc::clone(
            groups
                .entry(group)
                .or_insert_with(|| Arc::new(Mutex::new(GroupState::new()))),
        )
    }

    /// Seed the store with persisted descriptors
    pub async fn load(&self, descriptors: Vec<GlobalTransactionDescriptor>) {
        for descriptor in descriptors {
            let group = self.group(descriptor.group).await;
            group.lock().await.insert(descriptor);
        }
    }

    /// Register the intent to apply `sid` under `proposed`.
    ///
    /// Returns true exactly once per server transaction id. A first-seen id
    /// whose proposed global id is below the group's low watermark was
    /// already purged and cannot be trusted.
    pub async fn start_apply(
        &self,
        sid: &ServerTransactionID,
        proposed: GlobalTransactionID,
        group: GroupID,
    ) -> Result<bool> {
        let state = self.group(group).await;
        let mut state = state.lock().await;

        if let Some(descriptor) = state.by_sid.get_mut(sid) {
            return Ok(descriptor.initiate_apply());
        }

        if proposed.is_null() {
            return Err(Error::IllegalState(format!(
                "{} has no global transaction id",
                sid
            )));
        }
        if !state.low_watermark.is_null() && proposed < state.low_watermark {
            return Err(Error::UnknownTransaction {
                node: sid.source.clone(),
                txn: sid.txn,
                gid: proposed,
                low_watermark: state.low_watermark,
            });
        }

        let mut descriptor = GlobalTransactionDescriptor::new(sid.clone(), proposed, group);
        descriptor.initiate_apply();
        state.insert(descriptor);
        Ok(true)
    }

    /// Drop descriptors whose apply started but will never commit. Applied
    /// descriptors are kept. Returns the dropped ids.
    pub async fn abort_apply(
        &self,
        sids: &[ServerTransactionID],
        group: GroupID,
    ) -> Vec<ServerTransactionID> {
        let state = self.group(group).await;
        let mut state = state.lock().await;
        let mut aborted = Vec::new();
        for sid in sids {
            if state.by_sid.get(sid).map_or(false, |d| d.is_applying()) {
                state.remove(sid);
                aborted.push(sid.clone());
            }
        }
        aborted
    }

    /// Record `gid` for `sid` unless one is already recorded; returns the
    /// recorded id either way
    pub async fn get_or_insert(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
        gid: GlobalTransactionID,
    ) -> GlobalTransactionID {
        let state = self.group(group).await;
        let mut state = state.lock().await;
        if let Some(existing) = state.by_sid.get(sid) {
            return existing.global_txn_id;
        }
        state.insert(GlobalTransactionDescriptor::new(sid.clone(), gid, group));
        gid
    }

    pub async fn descriptor(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
    ) -> Option<GlobalTransactionDescriptor> {
        let state = self.group(group).await;
        let state = state.lock().await;
        state.by_sid.get(sid).cloned()
    }

    /// Mark `sid` applied, returning the updated descriptor
    pub async fn commit(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
    ) -> Result<GlobalTransactionDescriptor> {
        let state = self.group(group).await;
        let mut state = state.lock().await;
        let descriptor = state.by_sid.get_mut(sid).ok_or_else(|| {
            Error::IllegalState(format!("commit of untracked transaction {}", sid))
        })?;
        descriptor.mark_applied();
        Ok(descriptor.clone())
    }

    /// Advance the group's low watermark and drop every applied descriptor
    /// strictly below it. Returns the purged ids.
    pub async fn clear_below_gid(
        &self,
        gid: GlobalTransactionID,
        group: GroupID,
    ) -> Vec<ServerTransactionID> {
        let state = self.group(group).await;
        let mut state = state.lock().await;
        if gid > state.low_watermark {
            state.low_watermark = gid;
        }
        let low_watermark = state.low_watermark;

        let candidates: Vec<ServerTransactionID> = state
            .by_gid
            .range(..low_watermark)
            .map(|(_, sid)| sid.clone())
            .collect();

        let mut purged = Vec::with_capacity(candidates.len());
        for sid in candidates {
            if state.by_sid.get(&sid).map_or(false, |d| d.is_applied()) {
                state.remove(&sid);
                purged.push(sid);
            }
        }
        purged
    }

    /// Drop applied descriptors from `sid`'s source with a lower
    /// transaction id
    pub async fn clear_below_server_txn_id(
        &self,
        sid: &ServerTransactionID,
        group: GroupID,
    ) -> Vec<ServerTransactionID> {
        let state = self.group(group).await;
        let mut state = state.lock().await;
        state.remove_where(|d| {
            d.is_applied() && d.server_txn_id.source == sid.source && d.server_txn_id.txn < sid.txn
        })
    }

    /// Forget every descriptor originating from `node`, in every group
    pub async fn shutdown_node(&self, node: &NodeID) -> Vec<ServerTransactionID> {
        let groups: Vec<_> = self.groups.read().await.values().cloned().collect();
        let mut purged = Vec::new();
        for state in groups {
            let mut state = state.lock().await;
            purged.extend(state.remove_where(|d| &d.server_txn_id.source == node));
        }
        purged
    }

    /// Smallest tracked global id in `group`, or `NULL_ID`
    pub async fn least_global_transaction_id(&self, group: GroupID) -> GlobalTransactionID {
        let state = self.group(group).await;
        let state = state.lock().await;
        state
            .by_gid
            .keys()
            .next()
            .copied()
            .unwrap_or(GlobalTransactionID::NULL_ID)
    }

    /// Highest tracked global id across every group, or `NULL_ID`
    pub async fn max_global_transaction_id(&self) -> GlobalTransactionID {
        let groups: Vec<_> = self.groups.read().await.values().cloned().collect();
        let mut max = GlobalTransactionID::NULL_ID;
        for state in groups {
            if let Some(gid) = state.lock().await.by_gid.keys().next_back() {
                max = max.max(*gid);
            }
        }
        max
    }

    pub async fn low_watermark(&self, group: GroupID) -> GlobalTransactionID {
        let state = self.group(group).await;
        let low_watermark = state.lock().await.low_watermark;
        low_watermark
    }

    /// Tracked descriptors across every group
    pub async fn size(&self) -> usize {
        let groups: Vec<_> = self.groups.read().await.values().cloned().collect();
        let mut total = 0;
        for state in groups {
            total += state.lock().await.by_sid.len();
        }
        total
    }

    pub async fn size_for(&self, group: GroupID) -> usize {
        let state = self.group(group).await;
        let size = state.lock().await.by_sid.len();
        size
    }
}
