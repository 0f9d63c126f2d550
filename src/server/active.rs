//! Active transaction pipeline
//!
//! Two stages keyed by client so each client's batches stay in order:
//!
//! - the commit stage decodes a batch, checks wire ordering, assigns global
//!   ids and relays the transactions to the passives
//! - the apply stage commits the descriptors, reports local completion to
//!   the replication sender and acknowledges the batch to the client

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gtx::GlobalTransactionManager;
use crate::handshake::{ChannelManager, ClientMessage, HandshakeSink, SequenceValidator};
use crate::id::{ClientID, GroupID, NodeID, SequenceID, ServerTransactionID, TransactionID, TxnBatchID};
use crate::persistence::ClientStatePersistor;
use crate::replication::ReplicationSender;
use crate::stage::{EventHandler, StageSink};
use crate::tx::{CommitBatch, ServerTransaction};

/// Events of the commit stage
#[derive(Debug)]
pub enum CommitEvent {
    /// Encoded batch straight from the client
    Batch {
        client: ClientID,
        bytes: Vec<u8>,
        low_watermark: TransactionID,
    },
    /// Transactions replayed from a reconnect handshake
    Resend {
        client: ClientID,
        transactions: Vec<ServerTransaction>,
    },
    Disconnected(ClientID),
}

/// Events of the apply stage
#[derive(Debug)]
pub enum ApplyEvent {
    Apply {
        client: ClientID,
        /// `None` for replayed transactions nobody waits on
        batch_id: Option<TxnBatchID>,
        transactions: Vec<ServerTransaction>,
        low_watermark: TransactionID,
    },
    Disconnected(ClientID),
}

/// Decodes, orders and sequences client transactions
pub struct CommitHandler {
    group: GroupID,
    gtxm: Arc<GlobalTransactionManager>,
    validator: Arc<SequenceValidator>,
    sender: Arc<ReplicationSender>,
    clients: Arc<dyn ChannelManager>,
    apply: StageSink<ApplyEvent>,
    started: Arc<AtomicBool>,
    /// Held from gid assignment until relay, so gids reach the sender in order
    relay_order: Mutex<()>,
}

impl CommitHandler {
    pub fn new(
        group: GroupID,
        gtxm: Arc<GlobalTransactionManager>,
        validator: Arc<SequenceValidator>,
        sender: Arc<ReplicationSender>,
        clients: Arc<dyn ChannelManager>,
        apply: StageSink<ApplyEvent>,
        started: Arc<AtomicBool>,
    ) -> Self {
        Self {
            group,
            gtxm,
            validator,
            sender,
            clients,
            apply,
            started,
            relay_order: Mutex::new(()),
        }
    }

    /// Check, sequence and relay one run of a client's transactions.
    ///
    /// Changes and wire order are checked for the whole run before any
    /// descriptor is touched. If sequencing or the relay fails, every apply
    /// started here is aborted and the client's expected sequence id stays
    /// where it was.
    async fn sequence_and_relay(
        &self,
        client: ClientID,
        transactions: Vec<ServerTransaction>,
    ) -> Result<Vec<ServerTransaction>> {
        if transactions.is_empty() {
            return Ok(transactions);
        }
        for txn in &transactions {
            txn.validate_changes()?;
        }
        let run: Vec<SequenceID> = transactions.iter().map(|t| t.sequence_id).collect();
        let (start, next) = self.validator.check_run(client, &run).await?;

        let _order = self.relay_order.lock().await;
        let mut started = Vec::with_capacity(transactions.len());
        let relayed = match self.sequence(transactions, &mut started).await {
            Ok(fresh) => self.sender.relay(fresh.clone()).await.map(|()| fresh),
            Err(e) => Err(e),
        };
        match relayed {
            Ok(fresh) => {
                if !self.validator.advance_to(client, start, next).await {
                    debug!(%client, "Client re-seeded while its run was sequenced");
                }
                Ok(fresh)
            }
            Err(e) => {
                self.gtxm.abort_apply(&started, self.group).await;
                Err(e)
            }
        }
    }

    /// Assign global ids; returns the transactions seen for the first time.
    /// A transaction that already carries a global id proposes it.
    async fn sequence(
        &self,
        transactions: Vec<ServerTransaction>,
        started: &mut Vec<ServerTransactionID>,
    ) -> Result<Vec<ServerTransaction>> {
        let mut fresh = Vec::with_capacity(transactions.len());
        for mut txn in transactions {
            let sid = txn.server_transaction_id();
            let gid = if txn.global_txn_id.is_null() {
                self.gtxm
                    .get_or_create_global_transaction_id(&sid, self.group)
                    .await?
            } else {
                txn.global_txn_id
            };
            if self.gtxm.start_apply(&sid, gid, self.group).await? {
                started.push(sid);
                txn.global_txn_id = gid;
                fresh.push(txn);
            }
        }
        Ok(fresh)
    }

    async fn reject(&self, client: ClientID, err: Error) -> Result<()> {
        if err.is_session_fatal() {
            warn!(%client, error = %err, "Closing client session");
            self.clients.refuse(client, err.to_string()).await;
        }
        Err(err)
    }
}

#[async_trait]
impl EventHandler<CommitEvent> for CommitHandler {
    async fn handle(&self, event: CommitEvent) -> Result<()> {
        match event {
            CommitEvent::Batch {
                client,
                bytes,
                low_watermark,
            } => {
                if !self.started.load(Ordering::SeqCst) {
                    return self
                        .reject(client, Error::Protocol(format!("{} committed before start", client)))
                        .await;
                }
                let batch = match CommitBatch::decode(&NodeID::Client(client), &bytes) {
                    Ok(batch) => batch,
                    Err(e) => return self.reject(client, e).await,
                };
                let batch_id = batch.batch_id;
                debug!(%client, batch = %batch_id, count = batch.transactions.len(), "Commit batch received");

                let transactions = match self.sequence_and_relay(client, batch.transactions).await {
                    Ok(transactions) => transactions,
                    Err(e) => return self.reject(client, e).await,
                };
                self.apply
                    .add(
                        &client,
                        ApplyEvent::Apply {
                            client,
                            batch_id: Some(batch_id),
                            transactions,
                            low_watermark,
                        },
                    )
                    .await
            }
            CommitEvent::Resend {
                client,
                mut transactions,
            } => {
                for txn in &mut transactions {
                    txn.is_resent = true;
                }
                let count = transactions.len();
                let transactions = match self.sequence_and_relay(client, transactions).await {
                    Ok(transactions) => transactions,
                    Err(e) => return self.reject(client, e).await,
                };
                info!(%client, resent = count, fresh = transactions.len(), "Replayed resent transactions");
                self.apply
                    .add(
                        &client,
                        ApplyEvent::Apply {
                            client,
                            batch_id: None,
                            transactions,
                            low_watermark: TransactionID::NULL_ID,
                        },
                    )
                    .await
            }
            CommitEvent::Disconnected(client) => {
                if self.clients.is_connected(client).await {
                    debug!(%client, "Ignoring disconnect of a superseded connection");
                    return Ok(());
                }
                self.validator.remove(client).await;
                self.apply.add(&client, ApplyEvent::Disconnected(client)).await
            }
        }
    }
}

/// Commits applied transactions and answers the client
pub struct ApplyHandler {
    pub group: GroupID,
    pub gtxm: Arc<GlobalTransactionManager>,
    pub sender: Arc<ReplicationSender>,
    pub clients: Arc<dyn ChannelManager>,
    pub client_state: Arc<dyn ClientStatePersistor>,
}

#[async_trait]
impl EventHandler<ApplyEvent> for ApplyHandler {
    async fn handle(&self, event: ApplyEvent) -> Result<()> {
        match event {
            ApplyEvent::Apply {
                client,
                batch_id,
                transactions,
                low_watermark,
            } => {
                let sids: Vec<ServerTransactionID> = transactions
                    .iter()
                    .map(ServerTransaction::server_transaction_id)
                    .collect();
                self.gtxm.commit_all(&sids, self.group).await?;

                let gids: Vec<_> = transactions.iter().map(|t| t.global_txn_id).collect();
                self.sender.local_commit(&gids).await?;

                if !low_watermark.is_null() {
                    let below = ServerTransactionID::new(client, low_watermark);
                    self.gtxm.clear_below_server_txn_id(&below, self.group).await?;
                }

                if let Some(batch_id) = batch_id {
                    let reply = ClientMessage::TransactionsCommitted {
                        batch_id,
                        transaction_ids: transactions.iter().map(|t| t.transaction_id).collect(),
                    };
                    if let Err(e) = self.clients.send(client, reply).await {
                        debug!(%client, batch = %batch_id, "Client gone before commit ack: {}", e);
                    }
                }
                Ok(())
            }
            ApplyEvent::Disconnected(client) => {
                if self.clients.is_connected(client).await {
                    debug!(%client, "Client reconnected, keeping its transactions");
                    return Ok(());
                }
                let purged = self.gtxm.shutdown_node(&NodeID::Client(client)).await?;
                self.client_state.delete_client_state(client).await?;
                info!(%client, purged, "Client disconnected");
                Ok(())
            }
        }
    }
}

/// Hands reconnecting clients' work to the commit stage
pub struct CommitGate {
    pub commits: StageSink<CommitEvent>,
    pub started: Arc<AtomicBool>,
}

#[async_trait]
impl HandshakeSink for CommitGate {
    async fn resend(&self, client: ClientID, transactions: Vec<ServerTransaction>) -> Result<()> {
        self.commits
            .add(&client, CommitEvent::Resend { client, transactions })
            .await
    }

    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        info!("Transaction pipeline started");
        Ok(())
    }
}
