//! Replication Sender
//!
//! Active side of the group: relays committed transactions to every passive,
//! tracks which passives have acknowledged each global transaction and
//! advances the group low watermark once a transaction is applied locally
//! and acknowledged everywhere.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::interval;

use super::{GroupManager, GroupMessage};
use crate::error::Result;
use crate::gtx::GlobalTransactionManager;
use crate::id::{GlobalTransactionID, GroupID, ServerID, ServerTransactionID};
use crate::tx::ServerTransaction;

/// A relayed transaction not yet complete
#[derive(Debug)]
struct InFlight {
    sid: ServerTransactionID,
    /// Passives that have not acknowledged yet
    waiting: HashSet<ServerID>,
    applied_locally: bool,
}

#[derive(Debug)]
struct SenderState {
    passives: HashSet<ServerID>,
    in_flight: BTreeMap<GlobalTransactionID, InFlight>,
    /// Completed since the last relay
    completed: Vec<ServerTransactionID>,
    highest: GlobalTransactionID,
    low_watermark: GlobalTransactionID,
}

/// Active-side relay of committed transactions
pub struct ReplicationSender {
    group: GroupID,
    groups: Arc<dyn GroupManager>,
    gtxm: Arc<GlobalTransactionManager>,
    state: RwLock<SenderState>,
}

impl ReplicationSender {
    pub fn new(group: GroupID, groups: Arc<dyn GroupManager>, gtxm: Arc<GlobalTransactionManager>) -> Self {
        Self {
            group,
            groups,
            gtxm,
            state: RwLock::new(SenderState {
                passives: HashSet::new(),
                in_flight: BTreeMap::new(),
                completed: Vec::new(),
                highest: GlobalTransactionID::NULL_ID,
                low_watermark: GlobalTransactionID::NULL_ID,
            }),
        }
    }

    /// Start relaying to `node`
    pub async fn add_passive(&self, node: ServerID) {
        tracing::info!(passive = %node, "Passive joined group");
        self.state.write().await.passives.insert(node);
    }

    /// Stop waiting on `node`
    pub async fn remove_passive(&self, node: &ServerID) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.passives.remove(node);
            for entry in state.in_flight.values_mut() {
                entry.waiting.remove(node);
            }
        }
        tracing::info!(passive = %node, "Passive left group");
        self.complete().await
    }

    /// Relay transactions that already carry their global id.
    ///
    /// On failure nothing stays in flight for them, so a relay that never
    /// left cannot hold the low watermark back.
    pub async fn relay(&self, transactions: Vec<ServerTransaction>) -> Result<()> {
        if transactions.is_empty() {
            return Ok(());
        }
        let gids: Vec<GlobalTransactionID> = transactions.iter().map(|t| t.global_txn_id).collect();
        let (low_watermark, completed, has_passives) = {
            let mut state = self.state.write().await;
            for txn in &transactions {
                let waiting = state.passives.clone();
                state.in_flight.insert(
                    txn.global_txn_id,
                    InFlight {
                        sid: txn.server_transaction_id(),
                        waiting,
                        applied_locally: false,
                    },
                );
            }
            (
                state.low_watermark,
                std::mem::take(&mut state.completed),
                !state.passives.is_empty(),
            )
        };

        let sent = if has_passives {
            tracing::debug!(count = transactions.len(), low_watermark = %low_watermark, "Relaying transactions");
            self.groups
                .send_all(GroupMessage::RelayedCommit {
                    group: self.group,
                    transactions,
                    low_watermark,
                    completed: completed.clone(),
                })
                .await
        } else {
            Ok(())
        };

        let mut state = self.state.write().await;
        match sent {
            Ok(()) => {
                if let Some(max) = gids.iter().max() {
                    state.highest = state.highest.max(*max);
                }
                Ok(())
            }
            Err(e) => {
                for gid in &gids {
                    state.in_flight.remove(gid);
                }
                let mut restored = completed;
                restored.append(&mut state.completed);
                state.completed = restored;
                tracing::warn!(count = gids.len(), error = %e, "Relay failed, transactions withdrawn");
                Err(e)
            }
        }
    }

    /// Transactions applied and committed on the active
    pub async fn local_commit(&self, gids: &[GlobalTransactionID]) -> Result<()> {
        {
            let mut state = self.state.write().await;
            for gid in gids {
                if let Some(entry) = state.in_flight.get_mut(gid) {
                    entry.applied_locally = true;
                }
            }
        }
        self.complete().await
    }

    /// Acknowledgment from a passive
    pub async fn handle_ack(
        &self,
        from: &ServerID,
        acked: &[(ServerTransactionID, GlobalTransactionID)],
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            for (sid, gid) in acked {
                match state.in_flight.get_mut(gid) {
                    Some(entry) if &entry.sid == sid => {
                        entry.waiting.remove(from);
                    }
                    _ => tracing::debug!(from = %from, txn = %sid, gid = %gid, "Ack for unknown transaction"),
                }
            }
        }
        self.complete().await
    }

    /// Retire complete transactions and advance the low watermark
    async fn complete(&self) -> Result<()> {
        let advanced = {
            let mut state = self.state.write().await;
            let done: Vec<GlobalTransactionID> = state
                .in_flight
                .iter()
                .filter(|(_, e)| e.applied_locally && e.waiting.is_empty())
                .map(|(gid, _)| *gid)
                .collect();
            for gid in done {
                if let Some(entry) = state.in_flight.remove(&gid) {
                    state.completed.push(entry.sid);
                }
            }

            let candidate = match state.in_flight.keys().next() {
                Some(least) => *least,
                None if state.highest.is_null() => GlobalTransactionID::NULL_ID,
                None => state.highest.next(),
            };
            if candidate > state.low_watermark {
                state.low_watermark = candidate;
                Some(candidate)
            } else {
                None
            }
        };

        if let Some(low_watermark) = advanced {
            self.gtxm.set_low_watermark(low_watermark, self.group).await?;
            self.broadcast_low_watermark(low_watermark).await?;
        }
        Ok(())
    }

    async fn broadcast_low_watermark(&self, low_watermark: GlobalTransactionID) -> Result<()> {
        if self.state.read().await.passives.is_empty() {
            return Ok(());
        }
        self.groups
            .send_all(GroupMessage::LowWatermark {
                group: self.group,
                low_watermark,
            })
            .await
    }

    pub async fn low_watermark(&self) -> GlobalTransactionID {
        self.state.read().await.low_watermark
    }

    /// Relayed transactions not yet complete
    pub async fn in_flight(&self) -> usize {
        self.state.read().await.in_flight.len()
    }

    /// Re-broadcast the low watermark periodically so late joiners catch up
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let low_watermark = self.low_watermark().await;
                    if !low_watermark.is_null() {
                        if let Err(e) = self.broadcast_low_watermark(low_watermark).await {
                            tracing::warn!("Low watermark broadcast failed: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReplicationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSender")
            .field("group", &self.group)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ClientID, SequenceID, TransactionID, TxnBatchID};
    use crate::persistence::PersistenceGateway;
    use crate::replication::testing::RecordingGroupManager;

    fn txn(n: i64) -> ServerTransaction {
        ServerTransaction::new(ClientID(1), TxnBatchID(1), TransactionID(n), SequenceID(n), vec![])
            .with_global_txn_id(GlobalTransactionID(n * 10))
    }

    fn ack(n: i64) -> (ServerTransactionID, GlobalTransactionID) {
        (txn(n).server_transaction_id(), GlobalTransactionID(n * 10))
    }

    fn setup(peers: &[&str]) -> (ReplicationSender, Arc<RecordingGroupManager>) {
        let groups = Arc::new(RecordingGroupManager::new(peers));
        let gtxm = Arc::new(GlobalTransactionManager::new(&PersistenceGateway::in_memory()));
        (ReplicationSender::new(GroupID(0), groups.clone(), gtxm), groups)
    }

    #[tokio::test]
    async fn test_low_watermark_waits_for_every_passive() {
        let (sender, groups) = setup(&["p1", "p2"]);
        sender.add_passive(ServerID("p1".into())).await;
        sender.add_passive(ServerID("p2".into())).await;

        sender.relay(vec![txn(1), txn(2)]).await.unwrap();
        sender
            .local_commit(&[GlobalTransactionID(10), GlobalTransactionID(20)])
            .await
            .unwrap();
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(10));

        sender.handle_ack(&ServerID("p1".into()), &[ack(1), ack(2)]).await.unwrap();
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(10));

        sender.handle_ack(&ServerID("p2".into()), &[ack(1)]).await.unwrap();
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(20));
        assert_eq!(sender.in_flight().await, 1);

        let broadcasts = groups.broadcasts();
        assert!(matches!(broadcasts[0], GroupMessage::RelayedCommit { .. }));
        assert!(broadcasts.contains(&GroupMessage::LowWatermark {
            group: GroupID(0),
            low_watermark: GlobalTransactionID(20),
        }));
    }

    #[tokio::test]
    async fn test_departed_passive_no_longer_blocks() {
        let (sender, _groups) = setup(&["p1"]);
        sender.add_passive(ServerID("p1".into())).await;

        sender.relay(vec![txn(1)]).await.unwrap();
        sender.local_commit(&[GlobalTransactionID(10)]).await.unwrap();
        assert_eq!(sender.in_flight().await, 1);

        sender.remove_passive(&ServerID("p1".into())).await.unwrap();
        assert_eq!(sender.in_flight().await, 0);
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(11));
    }

    #[tokio::test]
    async fn test_completed_ids_ride_on_next_relay() {
        let (sender, groups) = setup(&["p1"]);
        sender.add_passive(ServerID("p1".into())).await;

        sender.relay(vec![txn(1)]).await.unwrap();
        sender.local_commit(&[GlobalTransactionID(10)]).await.unwrap();
        sender.handle_ack(&ServerID("p1".into()), &[ack(1)]).await.unwrap();
        sender.relay(vec![txn(2)]).await.unwrap();

        let relays: Vec<_> = groups
            .broadcasts()
            .into_iter()
            .filter_map(|m| match m {
                GroupMessage::RelayedCommit { completed, .. } => Some(completed),
                _ => None,
            })
            .collect();
        assert_eq!(relays.len(), 2);
        assert!(relays[0].is_empty());
        assert_eq!(relays[1], vec![ack(1).0]);
    }

    #[tokio::test]
    async fn test_failed_relay_is_withdrawn() {
        use std::sync::atomic::Ordering;

        let (sender, groups) = setup(&["p1"]);
        sender.add_passive(ServerID("p1".into())).await;

        sender.relay(vec![txn(1)]).await.unwrap();
        sender.local_commit(&[GlobalTransactionID(10)]).await.unwrap();
        sender.handle_ack(&ServerID("p1".into()), &[ack(1)]).await.unwrap();
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(11));

        groups.fail_broadcasts.store(true, Ordering::SeqCst);
        assert!(sender.relay(vec![txn(2)]).await.is_err());
        assert_eq!(sender.in_flight().await, 0);
        groups.fail_broadcasts.store(false, Ordering::SeqCst);

        sender.relay(vec![txn(3)]).await.unwrap();
        sender.local_commit(&[GlobalTransactionID(30)]).await.unwrap();
        sender.handle_ack(&ServerID("p1".into()), &[ack(3)]).await.unwrap();
        assert_eq!(sender.in_flight().await, 0);
        assert_eq!(sender.low_watermark().await, GlobalTransactionID(31));

        // The completed id withheld by the failed relay is carried by the next one
        let relays: Vec<_> = groups
            .broadcasts()
            .into_iter()
            .filter_map(|m| match m {
                GroupMessage::RelayedCommit { transactions, completed, .. } => Some((transactions, completed)),
                _ => None,
            })
            .collect();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[1].0[0].global_txn_id, GlobalTransactionID(30));
        assert_eq!(relays[1].1, vec![ack(1).0]);
    }
}
