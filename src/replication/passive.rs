//! Replicated Transaction Manager
//!
//! Passive side of the group. While a passive is still receiving the
//! active's object state (uninitialized), relayed transactions may reference
//! objects it has not seen yet. Those changes are buffered per object and
//! merged behind the object's full state when it arrives through object
//! sync, so no delta is ever applied before its base.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::ServerRole;
use crate::dna::Dna;
use crate::error::{Error, Result};
use crate::gtx::GlobalTransactionManager;
use crate::id::{GlobalTransactionID, GroupID, NodeID, ObjectID, ServerTransactionID};
use crate::tx::{ObjectSyncTransaction, ServerTransaction};

/// Local apply pipeline fed by the replicated transaction manager
#[async_trait]
pub trait TransactionSink: Send + Sync {
    /// Hand transactions over for local apply, in order
    async fn incoming_transactions(
        &self,
        source: &NodeID,
        transactions: Vec<ServerTransaction>,
    ) -> Result<()>;

    /// Transactions received whose every change is buffered until the
    /// objects they touch are synced
    async fn transactions_buffered(
        &self,
        source: &NodeID,
        held: Vec<(ServerTransactionID, GlobalTransactionID)>,
    ) -> Result<()>;

    /// Acknowledge an object sync transaction that needed no apply
    async fn ack_object_sync(&self, id: &ServerTransactionID) -> Result<()>;

    /// Transactions handed over but not yet applied
    fn pending_transactions(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
struct PendingRecord {
    sid: ServerTransactionID,
    gid: GlobalTransactionID,
    change: Dna,
}

/// Buffered changes for objects not known yet
#[derive(Debug, Default)]
struct PendingChangesAccount {
    /// Arrival order per object
    by_object: HashMap<ObjectID, Vec<PendingRecord>>,
    /// Objects each buffering transaction touches
    by_transaction: HashMap<ServerTransactionID, HashSet<ObjectID>>,
}

impl PendingChangesAccount {
    fn add(&mut self, txn: &ServerTransaction, change: Dna) {
        let oid = change.object_id();
        let sid = txn.server_transaction_id();
        self.by_transaction
            .entry(sid.clone())
            .or_default()
            .insert(oid);
        self.by_object.entry(oid).or_default().push(PendingRecord {
            sid,
            gid: txn.global_txn_id,
            change,
        });
    }

    /// Remove and return every buffered change for `oid`
    fn take(&mut self, oid: ObjectID) -> Vec<PendingRecord> {
        let records = self.by_object.remove(&oid).unwrap_or_default();
        for record in &records {
            if let Some(objects) = self.by_transaction.get_mut(&record.sid) {
                objects.remove(&oid);
                if objects.is_empty() {
                    self.by_transaction.remove(&record.sid);
                }
            }
        }
        records
    }

    /// Drop every buffered change of `sid`
    fn drop_transaction(&mut self, sid: &ServerTransactionID) {
        let Some(objects) = self.by_transaction.remove(sid) else {
            return;
        };
        for oid in objects {
            if let Some(records) = self.by_object.get_mut(&oid) {
                records.retain(|r| &r.sid != sid);
                if records.is_empty() {
                    self.by_object.remove(&oid);
                }
            }
        }
    }

    fn versions_for(&self, oid: ObjectID) -> Vec<GlobalTransactionID> {
        self.by_object
            .get(&oid)
            .map(|records| records.iter().map(|r| r.gid).collect())
            .unwrap_or_default()
    }

    /// Number of transactions with buffered changes
    fn size(&self) -> usize {
        self.by_transaction.len()
    }

    fn clear(&mut self) {
        self.by_object.clear();
        self.by_transaction.clear();
    }
}

/// Filters, buffers and merges replicated transactions on a passive
pub struct ReplicatedTransactionManager {
    role: ServerRole,
    group: GroupID,
    known_objects: HashSet<ObjectID>,
    pending: PendingChangesAccount,
    gtxm: Arc<GlobalTransactionManager>,
    sink: Arc<dyn TransactionSink>,
}

impl ReplicatedTransactionManager {
    /// A manager for a freshly started, uninitialized passive
    pub fn new(gtxm: Arc<GlobalTransactionManager>, sink: Arc<dyn TransactionSink>, group: GroupID) -> Self {
        Self {
            role: ServerRole::PassiveUninitialized,
            group,
            known_objects: HashSet::new(),
            pending: PendingChangesAccount::default(),
            gtxm,
            sink,
        }
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    /// Seed the set of objects already present locally
    pub fn init(&mut self, known: impl IntoIterator<Item = ObjectID>) {
        if self.role != ServerRole::PassiveUninitialized {
            info!(role = %self.role, "Not seeding known objects outside the uninitialized state");
            return;
        }
        self.known_objects.extend(known);
        debug!(known = self.known_objects.len(), "Seeded known objects");
    }

    /// Transactions relayed by the active
    pub async fn add_committed_transactions(
        &mut self,
        source: &NodeID,
        transactions: Vec<ServerTransaction>,
        completed: &[ServerTransactionID],
    ) -> Result<()> {
        match self.role {
            ServerRole::Active => {
                warn!(source = %source, count = transactions.len(), "Ignoring relayed transactions while active");
                Ok(())
            }
            ServerRole::PassiveStandby => self.sink.incoming_transactions(source, transactions).await,
            ServerRole::PassiveUninitialized => {
                let (forwarded, held) = self.prune(transactions);
                for sid in completed {
                    self.pending.drop_transaction(sid);
                }
                if !forwarded.is_empty() {
                    self.sink.incoming_transactions(source, forwarded).await?;
                }
                if !held.is_empty() {
                    debug!(source = %source, count = held.len(), "Transactions held for object sync");
                    self.sink.transactions_buffered(source, held).await?;
                }
                Ok(())
            }
        }
    }

    /// Split into transactions to forward and ids of those held entirely
    fn prune(
        &mut self,
        transactions: Vec<ServerTransaction>,
    ) -> (Vec<ServerTransaction>, Vec<(ServerTransactionID, GlobalTransactionID)>) {
        let mut forwarded = Vec::with_capacity(transactions.len());
        let mut held = Vec::new();

        for txn in transactions {
            let total = txn.changes.len();
            let mut passing = Vec::with_capacity(total);

            for dna in &txn.changes {
                let oid = dna.object_id();
                if !dna.is_delta() {
                    if self.known_objects.insert(oid) {
                        passing.push(dna.clone());
                    } else {
                        warn!(object = %oid, txn = %txn.server_transaction_id(), "Ignoring new object already present");
                    }
                } else if self.known_objects.contains(&oid) {
                    passing.push(dna.clone());
                } else {
                    self.pending.add(&txn, dna.clone());
                }
            }

            if passing.len() == total {
                forwarded.push(txn);
            } else if !passing.is_empty() {
                forwarded.push(txn.pruned(passing));
            } else {
                held.push((txn.server_transaction_id(), txn.global_txn_id));
            }
        }

        (forwarded, held)
    }

    /// Full object state from the active
    pub async fn add_object_sync_transaction(
        &mut self,
        sync: ObjectSyncTransaction,
        deleted_objects: &[ObjectID],
    ) -> Result<()> {
        match self.role {
            ServerRole::Active => Err(Error::Protocol(format!(
                "object sync transaction {} received while active",
                sync.id
            ))),
            ServerRole::PassiveStandby => {
                warn!(txn = %sync.id, "Ignoring object sync transaction while in standby");
                self.sink.ack_object_sync(&sync.id).await
            }
            ServerRole::PassiveUninitialized => {
                for oid in deleted_objects {
                    self.pending.take(*oid);
                }
                match self.compound(&sync)? {
                    Some(txn) => {
                        self.sink
                            .incoming_transactions(&sync.id.source, vec![txn])
                            .await
                    }
                    None => {
                        warn!(txn = %sync.id, "All object sync changes ignored, acknowledging directly");
                        self.sink.ack_object_sync(&sync.id).await
                    }
                }
            }
        }
    }

    /// Sync state followed by the buffered deltas of each newly known object
    fn compound(&mut self, sync: &ObjectSyncTransaction) -> Result<Option<ServerTransaction>> {
        let mut changes = Vec::with_capacity(sync.changes.len() * 2);
        let mut modified = false;

        for dna in &sync.changes {
            let oid = dna.object_id();
            let buffered = self.pending.take(oid);

            if self.known_objects.insert(oid) {
                let mut replayable = dna.clone();
                replayable.set_replayable(true);
                changes.push(replayable);

                let mut last_version = i64::MIN;
                for record in buffered {
                    let version = record.gid.as_i64();
                    if last_version >= version {
                        error!(object = %oid, last_version, version, "Buffered changes out of order");
                        return Err(Error::Protocol(format!(
                            "buffered changes for {} out of order: {} after {}",
                            oid, version, last_version
                        )));
                    }
                    changes.push(record.change.versionized(version));
                    last_version = version;
                    modified = true;
                }
            } else {
                debug!(object = %oid, txn = %sync.id, "Ignoring object sync for known object");
                modified = true;
                if !buffered.is_empty() {
                    return Err(Error::IllegalState(format!(
                        "known object {} had {} buffered changes",
                        oid,
                        buffered.len()
                    )));
                }
            }
        }

        if !modified {
            return Ok(Some(sync.to_server_transaction(sync.changes.clone())));
        }
        if changes.is_empty() {
            return Ok(None);
        }
        Ok(Some(sync.to_server_transaction(changes)))
    }

    /// Group low watermark advanced
    pub async fn clear_transactions_below_low_watermark(&mut self, gid: GlobalTransactionID) -> Result<()> {
        if self.role == ServerRole::Active {
            warn!(low_watermark = %gid, "Ignoring low watermark while active");
            return Ok(());
        }
        self.gtxm.set_low_watermark(gid, self.group).await?;
        Ok(())
    }

    /// Transactions not yet applied, including buffered ones
    pub fn pending_transactions(&self) -> usize {
        match self.role {
            ServerRole::Active => 0,
            ServerRole::PassiveStandby => self.sink.pending_transactions(),
            ServerRole::PassiveUninitialized => self.sink.pending_transactions() + self.pending.size(),
        }
    }

    /// Role transition of this server
    pub fn state_changed(&mut self, role: ServerRole) {
        if role == self.role {
            return;
        }
        match role {
            ServerRole::Active | ServerRole::PassiveStandby => {
                let dropped = self.pending.size();
                if dropped > 0 {
                    warn!(
                        transactions = dropped,
                        objects = self.pending.by_object.len(),
                        to = %role,
                        "Dropping changes buffered for objects that were never synced"
                    );
                }
                self.known_objects = HashSet::new();
                self.pending.clear();
                info!(from = %self.role, to = %role, "Replicated transaction manager changed role");
                self.role = role;
            }
            ServerRole::PassiveUninitialized => {
                warn!(from = %self.role, "Cannot return to the uninitialized state");
            }
        }
    }

    /// Versions of the changes buffered for `oid`, in arrival order
    pub fn pending_for(&self, oid: ObjectID) -> Vec<GlobalTransactionID> {
        self.pending.versions_for(oid)
    }

    pub fn is_known(&self, oid: ObjectID) -> bool {
        self.known_objects.contains(&oid)
    }
}

impl std::fmt::Debug for ReplicatedTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTransactionManager")
            .field("role", &self.role)
            .field("group", &self.group)
            .field("known_objects", &self.known_objects.len())
            .field("pending", &self.pending.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{DnaAction, DnaHeader, PhysicalAction, Value};
    use crate::id::{ClientID, SequenceID, ServerID, TransactionID, TxnBatchID};
    use crate::persistence::PersistenceGateway;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<ServerTransaction>>,
        held: Mutex<Vec<(ServerTransactionID, GlobalTransactionID)>>,
        acked: Mutex<Vec<ServerTransactionID>>,
    }

    #[async_trait]
    impl TransactionSink for RecordingSink {
        async fn incoming_transactions(
            &self,
            _source: &NodeID,
            transactions: Vec<ServerTransaction>,
        ) -> Result<()> {
            self.applied.lock().unwrap().extend(transactions);
            Ok(())
        }

        async fn transactions_buffered(
            &self,
            _source: &NodeID,
            held: Vec<(ServerTransactionID, GlobalTransactionID)>,
        ) -> Result<()> {
            self.held.lock().unwrap().extend(held);
            Ok(())
        }

        async fn ack_object_sync(&self, id: &ServerTransactionID) -> Result<()> {
            self.acked.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    fn delta(oid: i64, value: i64) -> Dna {
        Dna::new(
            DnaHeader::delta(ObjectID(oid), "com.acme.Counter"),
            vec![DnaAction::Physical(PhysicalAction::TruePhysical {
                field: "com.acme.Counter.value".into(),
                value: Value::Long(value),
                is_reference: false,
            })],
        )
    }

    fn full(oid: i64) -> Dna {
        Dna::new(DnaHeader::new_object(ObjectID(oid), "com.acme.Counter"), vec![])
    }

    fn txn(txn: i64, gid: i64, changes: Vec<Dna>) -> ServerTransaction {
        ServerTransaction::new(
            ClientID(1),
            TxnBatchID(1),
            TransactionID(txn),
            SequenceID(txn),
            changes,
        )
        .with_global_txn_id(GlobalTransactionID(gid))
    }

    fn sync(txn: i64, changes: Vec<Dna>) -> ObjectSyncTransaction {
        ObjectSyncTransaction::new(
            ServerTransactionID::new(NodeID::Server(ServerID("active".into())), TransactionID(txn)),
            changes,
        )
    }

    fn manager() -> (ReplicatedTransactionManager, Arc<RecordingSink>) {
        let gtxm = Arc::new(GlobalTransactionManager::new(&PersistenceGateway::in_memory()));
        let sink = Arc::new(RecordingSink::default());
        (
            ReplicatedTransactionManager::new(gtxm, sink.clone(), GroupID(0)),
            sink,
        )
    }

    fn active() -> NodeID {
        NodeID::Server(ServerID("active".into()))
    }

    #[tokio::test]
    async fn test_merge_ordering_for_unknown_object() {
        let (mut rtm, sink) = manager();
        rtm.init([ObjectID(1)]);

        rtm.add_committed_transactions(&active(), vec![txn(1, 101, vec![delta(7, 1)])], &[])
            .await
            .unwrap();
        rtm.add_committed_transactions(&active(), vec![txn(2, 102, vec![delta(7, 2)])], &[])
            .await
            .unwrap();
        assert!(sink.applied.lock().unwrap().is_empty());
        let held: Vec<_> = sink.held.lock().unwrap().iter().map(|(_, gid)| *gid).collect();
        assert_eq!(held, vec![GlobalTransactionID(101), GlobalTransactionID(102)]);
        assert_eq!(rtm.pending_for(ObjectID(7)), vec![GlobalTransactionID(101), GlobalTransactionID(102)]);
        assert_eq!(rtm.pending_transactions(), 2);

        rtm.add_object_sync_transaction(sync(1, vec![full(7)]), &[])
            .await
            .unwrap();

        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        let merged = &applied[0];
        assert!(merged.is_object_sync());
        assert_eq!(merged.changes.len(), 3);
        assert!(!merged.changes[0].is_delta());
        assert!(merged.changes[0].is_replayable());
        assert!(merged.changes[1].is_versionized());
        assert_eq!(merged.changes[1].version(), 101);
        assert_eq!(merged.changes[2].version(), 102);
        assert!(rtm.pending_for(ObjectID(7)).is_empty());
        assert_eq!(rtm.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_known_objects_pass_through() {
        let (mut rtm, sink) = manager();
        rtm.init([ObjectID(1), ObjectID(2)]);

        let original = txn(1, 10, vec![delta(1, 5), delta(2, 6), full(3)]);
        rtm.add_committed_transactions(&active(), vec![original.clone()], &[])
            .await
            .unwrap();

        assert_eq!(*sink.applied.lock().unwrap(), vec![original]);
        assert_eq!(rtm.pending_transactions(), 0);
        assert!(rtm.is_known(ObjectID(3)));
    }

    #[tokio::test]
    async fn test_partially_known_transaction_is_pruned() {
        let (mut rtm, sink) = manager();
        rtm.init([ObjectID(1)]);

        rtm.add_committed_transactions(&active(), vec![txn(1, 10, vec![delta(1, 5), delta(9, 6)])], &[])
            .await
            .unwrap();

        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].object_ids().into_iter().collect::<Vec<_>>(), vec![ObjectID(1)]);
        assert!(sink.held.lock().unwrap().is_empty());
        assert_eq!(rtm.pending_for(ObjectID(9)), vec![GlobalTransactionID(10)]);
    }

    #[tokio::test]
    async fn test_completed_transaction_drops_buffered_changes() {
        let (mut rtm, _sink) = manager();

        let buffered = txn(1, 10, vec![delta(5, 1)]);
        let sid = buffered.server_transaction_id();
        rtm.add_committed_transactions(&active(), vec![buffered], &[])
            .await
            .unwrap();
        assert_eq!(rtm.pending_for(ObjectID(5)).len(), 1);

        rtm.add_committed_transactions(&active(), vec![], &[sid])
            .await
            .unwrap();
        assert!(rtm.pending_for(ObjectID(5)).is_empty());
        assert_eq!(rtm.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_independent_unknown_objects() {
        let (mut rtm, sink) = manager();

        rtm.add_committed_transactions(&active(), vec![txn(1, 10, vec![delta(4, 1)])], &[])
            .await
            .unwrap();
        rtm.add_committed_transactions(&active(), vec![txn(2, 11, vec![delta(9, 1)])], &[])
            .await
            .unwrap();

        rtm.add_object_sync_transaction(sync(1, vec![full(9)]), &[])
            .await
            .unwrap();

        // Object 4 is still waiting for its own sync
        assert_eq!(rtm.pending_for(ObjectID(4)), vec![GlobalTransactionID(10)]);
        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].object_ids().into_iter().collect::<Vec<_>>(), vec![ObjectID(9)]);
    }

    #[tokio::test]
    async fn test_out_of_order_versions_are_rejected() {
        let (mut rtm, _sink) = manager();

        rtm.add_committed_transactions(&active(), vec![txn(1, 20, vec![delta(7, 1)])], &[])
            .await
            .unwrap();
        rtm.add_committed_transactions(&active(), vec![txn(2, 15, vec![delta(7, 2)])], &[])
            .await
            .unwrap();

        let err = rtm
            .add_object_sync_transaction(sync(1, vec![full(7)]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_sync_of_known_or_deleted_objects_is_acked() {
        let (mut rtm, sink) = manager();
        rtm.init([ObjectID(3)]);

        rtm.add_committed_transactions(&active(), vec![txn(1, 10, vec![delta(8, 1)])], &[])
            .await
            .unwrap();
        rtm.add_object_sync_transaction(sync(1, vec![full(3)]), &[ObjectID(8)])
            .await
            .unwrap();

        assert!(sink.applied.lock().unwrap().is_empty());
        assert_eq!(sink.acked.lock().unwrap().len(), 1);
        assert!(rtm.pending_for(ObjectID(8)).is_empty());
    }

    #[tokio::test]
    async fn test_standby_and_active_roles() {
        let (mut rtm, sink) = manager();
        rtm.add_committed_transactions(&active(), vec![txn(1, 10, vec![delta(8, 1)])], &[])
            .await
            .unwrap();

        rtm.state_changed(ServerRole::PassiveStandby);
        assert_eq!(rtm.pending_transactions(), 0);

        // Standby forwards everything
        rtm.add_committed_transactions(&active(), vec![txn(2, 11, vec![delta(8, 2)])], &[])
            .await
            .unwrap();
        assert_eq!(sink.applied.lock().unwrap().len(), 1);

        rtm.add_object_sync_transaction(sync(1, vec![full(8)]), &[])
            .await
            .unwrap();
        assert_eq!(sink.acked.lock().unwrap().len(), 1);

        rtm.state_changed(ServerRole::Active);
        rtm.add_committed_transactions(&active(), vec![txn(3, 12, vec![delta(8, 3)])], &[])
            .await
            .unwrap();
        assert_eq!(sink.applied.lock().unwrap().len(), 1);
        assert!(rtm
            .add_object_sync_transaction(sync(2, vec![full(8)]), &[])
            .await
            .is_err());
    }
}
