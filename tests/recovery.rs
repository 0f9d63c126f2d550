//! Crash/restart and replication behavior across module boundaries

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use dsoserver::dna::{Dna, DnaAction, DnaEncoding, DnaHeader, PhysicalAction, Value};
use dsoserver::gtx::GlobalTransactionManager;
use dsoserver::id::{
    ClientID, GlobalTransactionID, GroupID, NodeID, ObjectID, SequenceID, ServerTransactionID,
    TransactionID, TxnBatchID,
};
use dsoserver::persistence::{PersistenceGateway, SqlitePersistor};
use dsoserver::replication::{ReplicatedTransactionManager, TransactionSink};
use dsoserver::tx::{CommitBatch, ObjectSyncTransaction, ServerTransaction};
use dsoserver::Result;

const GROUP: GroupID = GroupID(0);

fn set_total(oid: i64, total: i64) -> Dna {
    Dna::new(
        DnaHeader::delta(ObjectID(oid), "com.acme.Order"),
        vec![DnaAction::Physical(PhysicalAction::TruePhysical {
            field: "com.acme.Order.total".into(),
            value: Value::Long(total),
            is_reference: false,
        })],
    )
}

fn new_order(oid: i64) -> Dna {
    Dna::new(
        DnaHeader::new_object(ObjectID(oid), "com.acme.Order"),
        vec![DnaAction::Physical(PhysicalAction::TruePhysical {
            field: "com.acme.Order.total".into(),
            value: Value::Long(0),
            is_reference: false,
        })],
    )
}

fn txn(n: i64, changes: Vec<Dna>) -> ServerTransaction {
    ServerTransaction::new(ClientID(7), TxnBatchID(1), TransactionID(n), SequenceID(n), changes)
}

fn open(dir: &std::path::Path) -> PersistenceGateway {
    PersistenceGateway::new(Arc::new(SqlitePersistor::new(dir).unwrap()), true)
}

async fn sequence_and_apply(
    gtxm: &GlobalTransactionManager,
    transactions: &[ServerTransaction],
) -> Vec<(ServerTransactionID, GlobalTransactionID, bool)> {
    let mut results = Vec::new();
    let mut fresh = Vec::new();
    for t in transactions {
        let sid = t.server_transaction_id();
        let gid = gtxm
            .get_or_create_global_transaction_id(&sid, GROUP)
            .await
            .unwrap();
        let first = gtxm.start_apply(&sid, gid, GROUP).await.unwrap();
        if first {
            fresh.push(sid.clone());
        }
        results.push((sid, gid, first));
    }
    gtxm.commit_all(&fresh, GROUP).await.unwrap();
    results
}

#[tokio::test]
async fn resent_batch_after_restart_is_not_reapplied() {
    let dir = tempfile::tempdir().unwrap();
    let client = NodeID::Client(ClientID(7));

    let batch = CommitBatch::new(
        TxnBatchID(1),
        vec![txn(1, vec![new_order(10)]), txn(2, vec![set_total(10, 99)])],
    );
    let bytes = batch.encode(DnaEncoding::default(), true).unwrap();

    let first_run = {
        let gateway = open(dir.path());
        let gtxm = GlobalTransactionManager::load(&gateway).await.unwrap();
        let decoded = CommitBatch::decode(&client, &bytes).unwrap();
        sequence_and_apply(&gtxm, &decoded.transactions).await
    };
    assert!(first_run.iter().all(|(_, _, first)| *first));

    // The client resends the same batch after the server restarted
    let gateway = open(dir.path());
    let gtxm = GlobalTransactionManager::load(&gateway).await.unwrap();
    let decoded = CommitBatch::decode(&client, &bytes).unwrap();
    let second_run = sequence_and_apply(&gtxm, &decoded.transactions).await;

    for (before, after) in first_run.iter().zip(&second_run) {
        assert_eq!(before.0, after.0);
        assert_eq!(before.1, after.1, "recorded pair keeps its global id");
        assert!(!after.2, "already applied transaction must not apply again");
    }

    // New work is ordered after everything recovered
    let next = sequence_and_apply(&gtxm, &[txn(3, vec![set_total(10, 100)])]).await;
    let highest = first_run.iter().map(|(_, gid, _)| *gid).max().unwrap();
    assert!(next[0].1 > highest);
    assert!(next[0].2);
}

#[tokio::test]
async fn low_watermark_purge_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let gateway = open(dir.path());
        let gtxm = GlobalTransactionManager::load(&gateway).await.unwrap();
        let applied = sequence_and_apply(&gtxm, &[txn(1, vec![]), txn(2, vec![]), txn(3, vec![])]).await;
        let third = applied[2].1;
        assert_eq!(gtxm.set_low_watermark(third, GROUP).await.unwrap(), 2);
    }

    let gateway = open(dir.path());
    let gtxm = GlobalTransactionManager::load(&gateway).await.unwrap();
    assert_eq!(gtxm.size_for(GROUP).await, 1);
}

#[derive(Default)]
struct CollectingSink {
    applied: Mutex<Vec<ServerTransaction>>,
    held: Mutex<Vec<GlobalTransactionID>>,
    acked: Mutex<Vec<ServerTransactionID>>,
}

#[async_trait]
impl TransactionSink for CollectingSink {
    async fn incoming_transactions(
        &self,
        _source: &NodeID,
        transactions: Vec<ServerTransaction>,
    ) -> Result<()> {
        self.applied.lock().await.extend(transactions);
        Ok(())
    }

    async fn transactions_buffered(
        &self,
        _source: &NodeID,
        held: Vec<(ServerTransactionID, GlobalTransactionID)>,
    ) -> Result<()> {
        self.held.lock().await.extend(held.into_iter().map(|(_, gid)| gid));
        Ok(())
    }

    async fn ack_object_sync(&self, id: &ServerTransactionID) -> Result<()> {
        self.acked.lock().await.push(id.clone());
        Ok(())
    }
}

#[tokio::test]
async fn late_passive_merges_deltas_behind_synced_state() {
    let gtxm = Arc::new(GlobalTransactionManager::new(&PersistenceGateway::in_memory()));
    let sink = Arc::new(CollectingSink::default());
    let mut rtm = ReplicatedTransactionManager::new(gtxm, sink.clone(), GROUP);
    let client = NodeID::Client(ClientID(7));

    // Deltas for object 20 arrive before its state
    let relayed = vec![
        txn(4, vec![set_total(20, 1)]).with_global_txn_id(GlobalTransactionID(40)),
        txn(5, vec![set_total(20, 2)]).with_global_txn_id(GlobalTransactionID(50)),
    ];
    rtm.add_committed_transactions(&client, relayed, &[])
        .await
        .unwrap();
    assert!(sink.applied.lock().await.is_empty());
    assert_eq!(
        *sink.held.lock().await,
        vec![GlobalTransactionID(40), GlobalTransactionID(50)]
    );
    assert_eq!(rtm.pending_transactions(), 2);

    let sync = ObjectSyncTransaction::new(
        ServerTransactionID::new(ClientID(7), TransactionID(100)),
        vec![new_order(20)],
    );
    rtm.add_object_sync_transaction(sync, &[]).await.unwrap();

    let applied = sink.applied.lock().await;
    assert_eq!(applied.len(), 1);
    let changes = &applied[0].changes;
    assert_eq!(changes.len(), 3);
    assert!(!changes[0].is_delta());
    assert_eq!(changes[1].version(), 40);
    assert_eq!(changes[2].version(), 50);
    assert_eq!(rtm.pending_transactions(), 0);
}
