//! DSO Server
//!
//! Wires the sequencer, persistence, handshake manager, replication and the
//! network transports into a running server. A server started with
//! `group.bootstrap_active` coordinates the group and accepts clients; every
//! other server runs as a passive and follows the active.

pub mod active;
pub mod passive;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::DsoConfig;
use crate::error::{Error, Result};
use crate::gtx::GlobalTransactionManager;
use crate::handshake::{
    ClientMessage, HandshakeContext, SequenceValidator, ServerClientHandshakeManager,
    TokioReconnectTimer,
};
use crate::id::{GroupID, ServerID};
use crate::network::{
    ClientEvent, ClientServer, GroupEvent, GroupTransportConfig, TcpGroupManager,
};
use crate::persistence::{
    PersistenceGateway, PersistentSequence, SqlitePersistor, OBJECT_ID_SEQUENCE,
};
use crate::replication::{
    publish_reset_request, GroupManager, GroupMessage, ReplicationSender, ServerRole,
};
use crate::stage::Stage;
use crate::tuning::{self, TunedConfig};

use active::{ApplyHandler, CommitEvent, CommitGate, CommitHandler};
use passive::{PassiveApplySink, PassiveHandler};

/// Object ids reserved per persisted block
const OBJECT_ID_BLOCK_SIZE: i64 = 10_000;

/// A configured server, ready to run
pub struct DsoServer {
    config: DsoConfig,
    gateway: PersistenceGateway,
    gtxm: Arc<GlobalTransactionManager>,
    tuned: TunedConfig,
}

impl DsoServer {
    /// Open persistence and recover the transaction store
    pub async fn new(config: DsoConfig) -> Result<Self> {
        let gateway = if config.node.persistent {
            let persistor = SqlitePersistor::new(config.data_dir())?;
            tracing::info!("Persistence database: {}", persistor.path().display());
            PersistenceGateway::new(Arc::new(persistor), true)
        } else {
            tracing::warn!("Running without persistence; state is lost on restart");
            PersistenceGateway::in_memory()
        };

        let gtxm = Arc::new(GlobalTransactionManager::load(&gateway).await?);
        let tuned = tuning::auto_tune(&config.stages);

        Ok(Self {
            config,
            gateway,
            gtxm,
            tuned,
        })
    }

    pub fn role(&self) -> ServerRole {
        if self.config.group.bootstrap_active {
            ServerRole::Active
        } else {
            ServerRole::PassiveUninitialized
        }
    }

    pub fn group(&self) -> GroupID {
        self.config.group_id()
    }

    pub fn global_transaction_manager(&self) -> Arc<GlobalTransactionManager> {
        Arc::clone(&self.gtxm)
    }

    /// Run until `shutdown` flips to true or a fatal error occurs
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (groups, group_events) = TcpGroupManager::new(GroupTransportConfig::from_config(&self.config));
        groups.start(shutdown.clone()).await?;

        tracing::info!(
            server = %self.config.server_id(),
            group = %self.group(),
            role = %self.role(),
            "Server starting"
        );

        match self.role() {
            ServerRole::Active => self.run_active(groups, group_events, shutdown).await,
            _ => self.run_passive(groups, group_events, shutdown).await,
        }
    }

    async fn run_active(
        self,
        groups: Arc<TcpGroupManager>,
        mut group_events: mpsc::Receiver<GroupEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let group = self.group();
        let queue_size = self.tuned.queue_size;

        let (clients, mut client_events) = ClientServer::new(
            self.config.node.client_bind_address.clone(),
            self.config.transactions.max_frame_size,
            queue_size,
        );

        let group_manager: Arc<dyn GroupManager> = groups.clone();
        let sender = Arc::new(ReplicationSender::new(group, group_manager.clone(), Arc::clone(&self.gtxm)));
        let validator = Arc::new(SequenceValidator::new(0));
        let started = Arc::new(AtomicBool::new(false));

        let apply_stage = Stage::start(
            "apply",
            self.tuned.persistence_workers,
            queue_size,
            Arc::new(ApplyHandler {
                group,
                gtxm: Arc::clone(&self.gtxm),
                sender: Arc::clone(&sender),
                clients: clients.clone(),
                client_state: Arc::clone(&self.gateway.clients),
            }),
        );
        let commit_stage = Stage::start(
            "commit",
            self.tuned.transaction_workers,
            queue_size,
            Arc::new(CommitHandler::new(
                group,
                Arc::clone(&self.gtxm),
                Arc::clone(&validator),
                Arc::clone(&sender),
                clients.clone(),
                apply_stage.sink(),
                Arc::clone(&started),
            )),
        );
        let commits = commit_stage.sink();

        let handshake = ServerClientHandshakeManager::new(HandshakeContext {
            server_id: self.config.server_id(),
            persistent: self.gateway.is_persistent(),
            channels: clients.clone(),
            sink: Arc::new(CommitGate {
                commits: commits.clone(),
                started: Arc::clone(&started),
            }),
            clients: Arc::clone(&self.gateway.clients),
            sequence_validator: Arc::clone(&validator),
            object_ids: Arc::new(PersistentSequence::new(
                OBJECT_ID_SEQUENCE,
                Arc::clone(&self.gateway.sequences),
                OBJECT_ID_BLOCK_SIZE,
            )),
            timer: Arc::new(TokioReconnectTimer::new()),
            reconnect_timeout: self.config.reconnect_timeout(),
            object_id_batch_size: self.config.handshake.object_id_batch_size,
        });

        if self.gateway.is_persistent() && self.config.reconnect_timeout().is_some() {
            handshake.set_starting_from_persisted().await?;
        } else {
            handshake.set_starting(Vec::new()).await?;
        }

        clients.start(shutdown.clone()).await?;

        let ticker = Arc::clone(&sender);
        let interval = self.config.low_watermark_interval();
        let ticker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = ticker.run(interval, ticker_shutdown).await {
                tracing::error!("Low watermark broadcaster failed: {}", e);
            }
        });

        let reset_ids = Arc::new(AtomicU64::new(1));
        let result = loop {
            tokio::select! {
                event = client_events.recv() => match event {
                    Some(ClientEvent::Message(client, ClientMessage::Handshake(hs))) => {
                        if let Err(e) = handshake.notify_client_connect(hs).await {
                            tracing::warn!(%client, "Handshake failed: {}", e);
                        }
                    }
                    Some(ClientEvent::Message(client, ClientMessage::CommitTransactions { batch, low_watermark })) => {
                        let event = CommitEvent::Batch { client, bytes: batch, low_watermark };
                        if let Err(e) = commits.add(&client, event).await {
                            break Err(e);
                        }
                    }
                    Some(ClientEvent::Message(client, other)) => {
                        tracing::warn!(%client, "Unexpected {} from client", other.type_name());
                    }
                    Some(ClientEvent::Disconnected(client)) => {
                        if let Err(e) = commits.add(&client, CommitEvent::Disconnected(client)).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                event = group_events.recv() => match event {
                    Some(GroupEvent::NodeJoined(node)) => {
                        let request_id = reset_ids.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(join_passive(
                            group,
                            group_manager.clone(),
                            Arc::clone(&sender),
                            node,
                            request_id,
                        ));
                    }
                    Some(GroupEvent::NodeLeft(node)) => {
                        if let Err(e) = sender.remove_passive(&node).await {
                            tracing::warn!(passive = %node, "Failed to drop passive: {}", e);
                        }
                    }
                    Some(GroupEvent::Message(from, GroupMessage::TransactionAck { group: acked_group, acked })) => {
                        if acked_group != group {
                            tracing::warn!(from = %from, "Ignoring ack for group {}", acked_group);
                        } else if let Err(e) = sender.handle_ack(&from, &acked).await {
                            tracing::error!(from = %from, "Failed to process ack: {}", e);
                        }
                    }
                    Some(GroupEvent::Message(from, GroupMessage::ObjectSyncAck { id })) => {
                        tracing::debug!(from = %from, txn = %id, "Object sync acknowledged");
                    }
                    Some(GroupEvent::Message(from, GroupMessage::Zap { reason })) => {
                        tracing::error!(from = %from, reason = %reason, "Zapped by group member");
                        break Err(Error::Replication(format!("zapped by {}: {}", from, reason)));
                    }
                    Some(GroupEvent::Message(from, other)) => {
                        tracing::warn!(from = %from, "Unexpected {} on the active", other.type_name());
                    }
                    None => break Ok(()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        drop(commits);
        drop(handshake);
        commit_stage.shutdown().await;
        apply_stage.shutdown().await;
        tracing::info!("Active server stopped");
        result
    }

    async fn run_passive(
        self,
        groups: Arc<TcpGroupManager>,
        mut group_events: mpsc::Receiver<GroupEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let group = self.group();
        let group_manager: Arc<dyn GroupManager> = groups;
        let sink = Arc::new(PassiveApplySink::new(
            group,
            Arc::clone(&self.gtxm),
            group_manager.clone(),
        ));
        let handler = Arc::new(PassiveHandler::new(
            group,
            Arc::clone(&self.gtxm),
            sink,
            group_manager,
        ));
        // One worker: the replicated transaction manager has a single owner
        let stage = Stage::start("replicated-transactions", 1, self.tuned.queue_size, handler);
        let relayed = stage.sink();

        let result = loop {
            tokio::select! {
                event = group_events.recv() => match event {
                    Some(GroupEvent::Message(from, GroupMessage::Zap { reason })) => {
                        tracing::error!(from = %from, reason = %reason, "Zapped by the active");
                        break Err(Error::Replication(format!("zapped by {}: {}", from, reason)));
                    }
                    Some(GroupEvent::Message(from, msg)) => {
                        if let Err(e) = relayed.add(&0u8, (from, msg)).await {
                            break Err(e);
                        }
                    }
                    Some(GroupEvent::NodeJoined(node)) => tracing::debug!(peer = %node, "Peer reachable"),
                    Some(GroupEvent::NodeLeft(node)) => tracing::warn!(peer = %node, "Peer unreachable"),
                    None => break Ok(()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        drop(relayed);
        stage.shutdown().await;
        tracing::info!("Passive server stopped");
        result
    }
}

/// Bring a newly connected passive into the group
async fn join_passive(
    group: GroupID,
    groups: Arc<dyn GroupManager>,
    sender: Arc<ReplicationSender>,
    node: ServerID,
    request_id: u64,
) {
    sender.add_passive(node.clone()).await;
    if let Err(e) = publish_reset_request(groups.as_ref(), &node, request_id).await {
        tracing::error!(passive = %node, "Object sync reset failed: {}", e);
        if let Err(e) = sender.remove_passive(&node).await {
            tracing::warn!(passive = %node, "Failed to drop passive: {}", e);
        }
        return;
    }
    if let Err(e) = groups
        .send_to(&node, GroupMessage::ObjectSyncComplete { group })
        .await
    {
        tracing::warn!(passive = %node, "Failed to complete object sync: {}", e);
    }
}

impl std::fmt::Debug for DsoServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsoServer")
            .field("server", &self.config.node.id)
            .field("role", &self.role())
            .field("gateway", &self.gateway)
            .finish()
    }
}
