//! Passive transaction pipeline
//!
//! Group messages from the active go through a single-worker stage that owns
//! the replicated transaction manager. Transactions it forwards are applied
//! through [`PassiveApplySink`], which acknowledges them back to the active.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gtx::GlobalTransactionManager;
use crate::id::{GlobalTransactionID, GroupID, NodeID, ServerID, ServerTransactionID};
use crate::replication::{
    GroupManager, GroupMessage, ReplicatedTransactionManager, ServerRole, TransactionSink,
};
use crate::stage::EventHandler;
use crate::tx::ServerTransaction;

/// Applies forwarded transactions locally and acknowledges them
pub struct PassiveApplySink {
    group: GroupID,
    gtxm: Arc<GlobalTransactionManager>,
    groups: Arc<dyn GroupManager>,
    active: RwLock<Option<ServerID>>,
    pending: AtomicUsize,
}

impl PassiveApplySink {
    pub fn new(group: GroupID, gtxm: Arc<GlobalTransactionManager>, groups: Arc<dyn GroupManager>) -> Self {
        Self {
            group,
            gtxm,
            groups,
            active: RwLock::new(None),
            pending: AtomicUsize::new(0),
        }
    }

    /// Server that acknowledgments go to
    pub async fn set_active(&self, active: ServerID) {
        let mut current = self.active.write().await;
        if current.as_ref() != Some(&active) {
            info!(active = %active, "Following active server");
            *current = Some(active);
        }
    }

    async fn send_to_active(&self, msg: GroupMessage) -> Result<()> {
        let active = self.active.read().await.clone();
        match active {
            Some(active) => self.groups.send_to(&active, msg).await,
            None => Err(Error::Replication(format!(
                "no active server to send {} to",
                msg.type_name()
            ))),
        }
    }

    async fn apply(&self, transactions: Vec<ServerTransaction>) -> Result<()> {
        let mut acked = Vec::with_capacity(transactions.len());
        let mut fresh = Vec::with_capacity(transactions.len());
        let mut synced = Vec::new();

        for txn in transactions {
            let sid = txn.server_transaction_id();
            if txn.is_object_sync() {
                synced.push(sid);
                continue;
            }
            if self.gtxm.start_apply(&sid, txn.global_txn_id, self.group).await? {
                fresh.push(sid.clone());
            }
            acked.push((sid, txn.global_txn_id));
        }

        self.gtxm.commit_all(&fresh, self.group).await?;

        for id in synced {
            self.send_to_active(GroupMessage::ObjectSyncAck { id }).await?;
        }
        if !acked.is_empty() {
            self.send_to_active(GroupMessage::TransactionAck {
                group: self.group,
                acked,
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionSink for PassiveApplySink {
    async fn incoming_transactions(
        &self,
        source: &NodeID,
        transactions: Vec<ServerTransaction>,
    ) -> Result<()> {
        let count = transactions.len();
        debug!(source = %source, count, "Applying replicated transactions");
        self.pending.fetch_add(count, Ordering::SeqCst);
        let result = self.apply(transactions).await;
        self.pending.fetch_sub(count, Ordering::SeqCst);
        result
    }

    async fn transactions_buffered(
        &self,
        source: &NodeID,
        held: Vec<(ServerTransactionID, GlobalTransactionID)>,
    ) -> Result<()> {
        // Their changes travel on with the object sync; the ids are recorded now
        let mut fresh = Vec::with_capacity(held.len());
        for (sid, gid) in &held {
            if self.gtxm.start_apply(sid, *gid, self.group).await? {
                fresh.push(sid.clone());
            }
        }
        self.gtxm.commit_all(&fresh, self.group).await?;
        debug!(source = %source, count = held.len(), "Acknowledging held transactions");
        self.send_to_active(GroupMessage::TransactionAck {
            group: self.group,
            acked: held,
        })
        .await
    }

    async fn ack_object_sync(&self, id: &ServerTransactionID) -> Result<()> {
        self.send_to_active(GroupMessage::ObjectSyncAck { id: id.clone() })
            .await
    }

    fn pending_transactions(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Owns the replicated transaction manager
pub struct PassiveHandler {
    group: GroupID,
    rtm: Mutex<ReplicatedTransactionManager>,
    sink: Arc<PassiveApplySink>,
    groups: Arc<dyn GroupManager>,
}

impl PassiveHandler {
    pub fn new(
        group: GroupID,
        gtxm: Arc<GlobalTransactionManager>,
        sink: Arc<PassiveApplySink>,
        groups: Arc<dyn GroupManager>,
    ) -> Self {
        let rtm = ReplicatedTransactionManager::new(gtxm, sink.clone(), group);
        Self {
            group,
            rtm: Mutex::new(rtm),
            sink,
            groups,
        }
    }

    pub async fn role(&self) -> ServerRole {
        self.rtm.lock().await.role()
    }

    pub async fn pending_transactions(&self) -> usize {
        self.rtm.lock().await.pending_transactions()
    }

    fn check_group(&self, group: GroupID, msg: &str) -> bool {
        if group != self.group {
            warn!(expected = %self.group, received = %group, "Ignoring {} for another group", msg);
            return false;
        }
        true
    }

    async fn clear_below(&self, rtm: &mut ReplicatedTransactionManager, gid: GlobalTransactionID) -> Result<()> {
        if gid.is_null() {
            return Ok(());
        }
        rtm.clear_transactions_below_low_watermark(gid).await
    }
}

#[async_trait]
impl EventHandler<(ServerID, GroupMessage)> for PassiveHandler {
    async fn handle(&self, (from, msg): (ServerID, GroupMessage)) -> Result<()> {
        let mut rtm = self.rtm.lock().await;
        match msg {
            GroupMessage::RelayedCommit {
                group,
                transactions,
                low_watermark,
                completed,
            } => {
                if !self.check_group(group, "relayed commit") {
                    return Ok(());
                }
                self.sink.set_active(from.clone()).await;
                let source = transactions
                    .first()
                    .map(|t| t.source.clone())
                    .unwrap_or(NodeID::Server(from));
                rtm.add_committed_transactions(&source, transactions, &completed)
                    .await?;
                self.clear_below(&mut rtm, low_watermark).await
            }
            GroupMessage::LowWatermark { group, low_watermark } => {
                if !self.check_group(group, "low watermark") {
                    return Ok(());
                }
                self.clear_below(&mut rtm, low_watermark).await
            }
            GroupMessage::ObjectSync {
                transaction,
                deleted_objects,
            } => {
                self.sink.set_active(from).await;
                rtm.add_object_sync_transaction(transaction, &deleted_objects)
                    .await
            }
            GroupMessage::ObjectSyncResetRequest { request_id } => {
                self.sink.set_active(from.clone()).await;
                info!(active = %from, request_id, "Object sync reset");
                self.groups
                    .send_to(
                        &from,
                        GroupMessage::ObjectSyncResetResponse {
                            request_id,
                            success: rtm.role() != ServerRole::Active,
                        },
                    )
                    .await
            }
            GroupMessage::ObjectSyncComplete { group } => {
                if !self.check_group(group, "object sync complete") {
                    return Ok(());
                }
                info!(active = %from, "Object sync complete");
                rtm.state_changed(ServerRole::PassiveStandby);
                Ok(())
            }
            other => {
                warn!(from = %from, "Unexpected {} on a passive", other.type_name());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{Dna, DnaAction, DnaHeader, PhysicalAction, Value};
    use crate::id::{ClientID, ObjectID, SequenceID, TransactionID, TxnBatchID};
    use crate::persistence::PersistenceGateway;
    use crate::replication::testing::RecordingGroupManager;

    const GROUP: GroupID = GroupID(0);

    fn new_object(oid: i64) -> Dna {
        Dna::new(DnaHeader::new_object(ObjectID(oid), "com.acme.Order"), vec![])
    }

    fn txn(n: i64, changes: Vec<Dna>) -> ServerTransaction {
        ServerTransaction::new(ClientID(1), TxnBatchID(1), TransactionID(n), SequenceID(n), changes)
            .with_global_txn_id(GlobalTransactionID(n))
    }

    fn setup() -> (PassiveHandler, Arc<RecordingGroupManager>, Arc<GlobalTransactionManager>) {
        let groups = Arc::new(RecordingGroupManager::new(&["active"]));
        let gtxm = Arc::new(GlobalTransactionManager::new(&PersistenceGateway::in_memory()));
        let sink = Arc::new(PassiveApplySink::new(GROUP, gtxm.clone(), groups.clone()));
        let handler = PassiveHandler::new(GROUP, gtxm.clone(), sink, groups.clone());
        (handler, groups, gtxm)
    }

    fn active() -> ServerID {
        ServerID("active".into())
    }

    #[tokio::test]
    async fn test_relayed_transactions_are_applied_and_acked() {
        let (handler, groups, gtxm) = setup();
        let relayed = GroupMessage::RelayedCommit {
            group: GROUP,
            transactions: vec![txn(1, vec![new_object(10)]), txn(2, vec![new_object(11)])],
            low_watermark: GlobalTransactionID::NULL_ID,
            completed: vec![],
        };
        handler.handle((active(), relayed.clone())).await.unwrap();

        assert_eq!(gtxm.size_for(GROUP).await, 2);
        let sent = groups.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (to, GroupMessage::TransactionAck { acked, .. }) => {
                assert_eq!(to, &Some(active()));
                assert_eq!(acked.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        // A relayed duplicate is acknowledged again but not re-applied
        handler.handle((active(), relayed)).await.unwrap();
        assert_eq!(gtxm.size_for(GROUP).await, 2);
        assert_eq!(groups.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_low_watermark_purges_applied() {
        let (handler, _groups, gtxm) = setup();
        let relayed = GroupMessage::RelayedCommit {
            group: GROUP,
            transactions: vec![txn(1, vec![new_object(10)]), txn(2, vec![new_object(11)])],
            low_watermark: GlobalTransactionID::NULL_ID,
            completed: vec![],
        };
        handler.handle((active(), relayed)).await.unwrap();

        handler
            .handle((
                active(),
                GroupMessage::LowWatermark {
                    group: GROUP,
                    low_watermark: GlobalTransactionID(2),
                },
            ))
            .await
            .unwrap();
        assert_eq!(gtxm.size_for(GROUP).await, 1);
        assert_eq!(gtxm.low_watermark(GROUP).await, GlobalTransactionID(2));
    }

    #[tokio::test]
    async fn test_buffered_delta_waits_for_sync() {
        let (handler, groups, _gtxm) = setup();
        let delta = Dna::new(
            DnaHeader::delta(ObjectID(50), "com.acme.Order"),
            vec![DnaAction::Physical(PhysicalAction::TruePhysical {
                field: "com.acme.Order.total".into(),
                value: Value::Long(3),
                is_reference: false,
            })],
        );
        let relayed = GroupMessage::RelayedCommit {
            group: GROUP,
            transactions: vec![txn(1, vec![delta])],
            low_watermark: GlobalTransactionID::NULL_ID,
            completed: vec![],
        };
        handler.handle((active(), relayed)).await.unwrap();
        assert_eq!(handler.pending_transactions().await, 1);
        let sent = groups.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![(
                Some(active()),
                GroupMessage::TransactionAck {
                    group: GROUP,
                    acked: vec![(txn(1, vec![]).server_transaction_id(), GlobalTransactionID(1))],
                }
            )]
        );

        handler
            .handle((active(), GroupMessage::ObjectSyncComplete { group: GROUP }))
            .await
            .unwrap();
        assert_eq!(handler.role().await, ServerRole::PassiveStandby);
        assert_eq!(handler.pending_transactions().await, 0);
    }

    #[tokio::test]
    async fn test_reset_request_is_answered() {
        let (handler, groups, _gtxm) = setup();
        handler
            .handle((active(), GroupMessage::ObjectSyncResetRequest { request_id: 9 }))
            .await
            .unwrap();
        let sent = groups.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![(
                Some(active()),
                GroupMessage::ObjectSyncResetResponse {
                    request_id: 9,
                    success: true
                }
            )]
        );
    }

    fn unknown_delta(oid: i64) -> Dna {
        Dna::new(
            DnaHeader::delta(ObjectID(oid), "com.acme.Order"),
            vec![DnaAction::Physical(PhysicalAction::TruePhysical {
                field: "com.acme.Order.total".into(),
                value: Value::Long(oid),
                is_reference: false,
            })],
        )
    }

    /// Deliver every message the active broadcast since `seen` to the passive
    async fn deliver(
        from: &RecordingGroupManager,
        seen: &mut usize,
        handler: &PassiveHandler,
    ) {
        let broadcasts = from.broadcasts();
        for msg in &broadcasts[*seen..] {
            handler.handle((active(), msg.clone())).await.unwrap();
        }
        *seen = broadcasts.len();
    }

    /// Forward the passive's acks to the sender
    async fn collect_acks(
        passive_out: &RecordingGroupManager,
        sender: &crate::replication::ReplicationSender,
    ) {
        let sent: Vec<_> = passive_out.sent.lock().unwrap().drain(..).collect();
        for (_, msg) in sent {
            if let GroupMessage::TransactionAck { acked, .. } = msg {
                sender.handle_ack(&ServerID("passive".into()), &acked).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_held_transactions_do_not_pin_group_low_watermark() {
        let active_out = Arc::new(RecordingGroupManager::new(&["passive"]));
        let active_gtxm = Arc::new(GlobalTransactionManager::new(&PersistenceGateway::in_memory()));
        let sender = crate::replication::ReplicationSender::new(GROUP, active_out.clone(), active_gtxm);
        sender.add_passive(ServerID("passive".into())).await;

        let (handler, passive_out, _passive_gtxm) = setup();
        let mut seen = 0;

        // Delta for an object the uninitialized passive has not seen
        let held = txn(5, vec![unknown_delta(77)]);
        sender.relay(vec![held]).await.unwrap();
        sender.local_commit(&[GlobalTransactionID(5)]).await.unwrap();
        deliver(&active_out, &mut seen, &handler).await;
        collect_acks(&passive_out, &sender).await;
        assert_eq!(sender.in_flight().await, 0);
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(6));

        handler
            .handle((active(), GroupMessage::ObjectSyncComplete { group: GROUP }))
            .await
            .unwrap();
        assert_eq!(handler.role().await, ServerRole::PassiveStandby);

        sender.relay(vec![txn(6, vec![new_object(78)])]).await.unwrap();
        sender.local_commit(&[GlobalTransactionID(6)]).await.unwrap();
        deliver(&active_out, &mut seen, &handler).await;
        collect_acks(&passive_out, &sender).await;
        assert_eq!(sender.in_flight().await, 0);
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(7));
    }
}
