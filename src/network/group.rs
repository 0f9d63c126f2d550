//! TCP group transport
//!
//! Each server listens on its group address and keeps one outbound
//! connection per configured peer. Every frame carries the sender's id, so a
//! server learns who it is talking to without a separate handshake.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::FrameCodec;
use crate::config::DsoConfig;
use crate::error::{Error, Result};
use crate::id::ServerID;
use crate::replication::{GroupManager, GroupMessage};

/// What the transport reports to the server
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    /// Outbound connection to a peer established
    NodeJoined(ServerID),
    /// Outbound connection to a peer lost
    NodeLeft(ServerID),
    Message(ServerID, GroupMessage),
}

/// Frame payload on group connections
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: ServerID,
    message: GroupMessage,
}

struct PeerLink {
    address: String,
    queue: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

/// Settings of the group transport
#[derive(Debug, Clone)]
pub struct GroupTransportConfig {
    pub local_id: ServerID,
    pub bind_address: String,
    pub peers: Vec<(ServerID, String)>,
    pub max_frame_size: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub queue_size: usize,
}

impl GroupTransportConfig {
    pub fn from_config(config: &DsoConfig) -> Self {
        Self {
            local_id: config.server_id(),
            bind_address: config.node.group_bind_address.clone(),
            peers: config
                .group
                .peers
                .iter()
                .map(|p| (ServerID(p.id.clone()), p.address.clone()))
                .collect(),
            max_frame_size: config.transactions.max_frame_size,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            queue_size: config.stages.queue_size,
        }
    }
}

/// [`GroupManager`] over TCP
pub struct TcpGroupManager {
    config: GroupTransportConfig,
    peers: RwLock<HashMap<ServerID, PeerLink>>,
    waiting: Mutex<HashMap<u64, oneshot::Sender<GroupMessage>>>,
    events: mpsc::Sender<GroupEvent>,
}

impl TcpGroupManager {
    /// Create the transport; group events are delivered on the returned
    /// receiver once [`TcpGroupManager::start`] runs
    pub fn new(config: GroupTransportConfig) -> (Arc<Self>, mpsc::Receiver<GroupEvent>) {
        let (events, receiver) = mpsc::channel(config.queue_size.max(1));
        let manager = Arc::new(Self {
            config,
            peers: RwLock::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            events,
        });
        (manager, receiver)
    }

    /// Listen for peers and connect to every configured peer
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("Group transport listening on {}", self.config.bind_address);

        for (id, address) in self.config.peers.clone() {
            self.connect_peer(id, address, shutdown.clone()).await;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop(listener, shutdown).await });
        Ok(())
    }

    async fn connect_peer(self: &Arc<Self>, id: ServerID, address: String, shutdown: watch::Receiver<bool>) {
        let (queue, receiver) = mpsc::channel(self.config.queue_size.max(1));
        let connected = Arc::new(AtomicBool::new(false));
        self.peers.write().await.insert(
            id.clone(),
            PeerLink {
                address: address.clone(),
                queue,
                connected: Arc::clone(&connected),
            },
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.writer_task(id, address, connected, receiver, shutdown).await;
        });
    }

    /// Keeps the outbound connection to one peer alive and drains its queue
    async fn writer_task(
        self: Arc<Self>,
        id: ServerID,
        address: String,
        connected: Arc<AtomicBool>,
        mut queue: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = Duration::from_millis(100);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = match self.connect(&address).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(peer = %id, "Connect failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    continue;
                }
            };
            backoff = Duration::from_millis(100);
            connected.store(true, Ordering::SeqCst);
            tracing::info!(peer = %id, address = %address, "Connected to peer");
            let _ = self.events.send(GroupEvent::NodeJoined(id.clone())).await;

            let mut framed = FramedWrite::new(stream, FrameCodec::new(self.config.max_frame_size));
            let closed = loop {
                tokio::select! {
                    frame = queue.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = framed.send(frame).await {
                                tracing::warn!(peer = %id, "Send failed: {}", e);
                                break false;
                            }
                        }
                        None => break true,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break true;
                        }
                    }
                }
            };

            connected.store(false, Ordering::SeqCst);
            let _ = self.events.send(GroupEvent::NodeLeft(id.clone())).await;
            if closed {
                break;
            }
        }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = this.read_connection(socket).await {
                                    tracing::warn!("Group connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Group transport stopped");
    }

    async fn read_connection(&self, socket: TcpStream) -> Result<()> {
        let mut frames = FramedRead::new(socket, FrameCodec::new(self.config.max_frame_size));
        while let Some(frame) = frames.next().await {
            let envelope: Envelope = bincode::deserialize(&frame?)?;
            tracing::trace!("Received {} from {}", envelope.message.type_name(), envelope.from);

            if let Some(request_id) = envelope.message.response_to() {
                if let Some(waiter) = self.waiting.lock().await.remove(&request_id) {
                    let _ = waiter.send(envelope.message);
                    continue;
                }
            }

            if self
                .events
                .send(GroupEvent::Message(envelope.from, envelope.message))
                .await
                .is_err()
            {
                break;
            }
        }
        Ok(())
    }

    fn encode(&self, message: GroupMessage) -> Result<Bytes> {
        let envelope = Envelope {
            from: self.config.local_id.clone(),
            message,
        };
        Ok(Bytes::from(bincode::serialize(&envelope)?))
    }

    async fn enqueue(&self, node: &ServerID, frame: Bytes) -> Result<()> {
        let queue = {
            let peers = self.peers.read().await;
            let link = peers
                .get(node)
                .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;
            link.queue.clone()
        };
        queue
            .send(frame)
            .await
            .map_err(|_| Error::Network(format!("link to {} is closed", node)))
    }

    /// Address configured for `node`
    pub async fn peer_address(&self, node: &ServerID) -> Option<String> {
        self.peers.read().await.get(node).map(|l| l.address.clone())
    }
}

#[async_trait]
impl GroupManager for TcpGroupManager {
    fn local_id(&self) -> &ServerID {
        &self.config.local_id
    }

    async fn members(&self) -> Vec<ServerID> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, link)| link.connected.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn send_all(&self, msg: GroupMessage) -> Result<()> {
        let frame = self.encode(msg)?;
        for node in self.members().await {
            if let Err(e) = self.enqueue(&node, frame.clone()).await {
                tracing::warn!(peer = %node, "Broadcast failed: {}", e);
            }
        }
        Ok(())
    }

    async fn send_to(&self, node: &ServerID, msg: GroupMessage) -> Result<()> {
        let frame = self.encode(msg)?;
        self.enqueue(node, frame).await
    }

    async fn send_all_and_wait_for_response(
        &self,
        msg: GroupMessage,
    ) -> Result<HashMap<ServerID, GroupMessage>> {
        let mut responses = HashMap::new();
        for node in self.members().await {
            let response = self.send_to_and_wait_for_response(&node, msg.clone()).await?;
            responses.insert(node, response);
        }
        Ok(responses)
    }

    async fn send_to_and_wait_for_response(
        &self,
        node: &ServerID,
        msg: GroupMessage,
    ) -> Result<GroupMessage> {
        let request_id = msg.request_id().ok_or_else(|| {
            Error::Replication(format!("{} does not expect a response", msg.type_name()))
        })?;

        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(request_id, tx);

        if let Err(e) = self.send_to(node, msg).await {
            self.waiting.lock().await.remove(&request_id);
            return Err(e);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Replication("Request cancelled".into())),
            Err(_) => {
                self.waiting.lock().await.remove(&request_id);
                Err(Error::ConnectionTimeout(node.to_string()))
            }
        }
    }

    async fn zap_node(&self, node: &ServerID, reason: &str) -> Result<()> {
        tracing::error!(peer = %node, reason, "Zapping node");
        self.send_to(
            node,
            GroupMessage::Zap {
                reason: reason.to_string(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::GlobalTransactionID;
    use crate::id::GroupID;

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn transport(id: &str, bind: &str, peer: (&str, &str)) -> GroupTransportConfig {
        GroupTransportConfig {
            local_id: ServerID(id.into()),
            bind_address: bind.into(),
            peers: vec![(ServerID(peer.0.into()), peer.1.into())],
            max_frame_size: 1 << 20,
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            queue_size: 64,
        }
    }

    async fn next_message(events: &mut mpsc::Receiver<GroupEvent>) -> (ServerID, GroupMessage) {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(GroupEvent::Message(from, msg))) => return (from, msg),
                Ok(Some(_)) => continue,
                other => panic!("no message received: {:?}", other),
            }
        }
    }

    async fn wait_connected(manager: &TcpGroupManager) {
        for _ in 0..200 {
            if !manager.members().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer never connected");
    }

    #[tokio::test]
    async fn test_two_servers_exchange_messages() {
        let a_addr = free_address();
        let b_addr = free_address();
        let (_tx, shutdown) = watch::channel(false);

        let (a, _a_events) = TcpGroupManager::new(transport("a", &a_addr, ("b", &b_addr)));
        let (b, mut b_events) = TcpGroupManager::new(transport("b", &b_addr, ("a", &a_addr)));
        a.start(shutdown.clone()).await.unwrap();
        b.start(shutdown.clone()).await.unwrap();
        wait_connected(&a).await;

        a.send_all(GroupMessage::LowWatermark {
            group: GroupID(0),
            low_watermark: GlobalTransactionID(7),
        })
        .await
        .unwrap();

        let (from, msg) = next_message(&mut b_events).await;
        assert_eq!(from, ServerID("a".into()));
        assert_eq!(msg.type_name(), "LowWatermark");

        // Request/response: b answers a's reset request
        wait_connected(&b).await;
        let b2 = Arc::clone(&b);
        tokio::spawn(async move {
            let (from, msg) = next_message(&mut b_events).await;
            if let GroupMessage::ObjectSyncResetRequest { request_id } = msg {
                b2.send_to(&from, GroupMessage::ObjectSyncResetResponse { request_id, success: true })
                    .await
                    .unwrap();
            }
        });

        let response = a
            .send_to_and_wait_for_response(
                &ServerID("b".into()),
                GroupMessage::ObjectSyncResetRequest { request_id: 42 },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            GroupMessage::ObjectSyncResetResponse { request_id: 42, success: true }
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_found() {
        let (a, _events) = TcpGroupManager::new(transport("a", "127.0.0.1:0", ("b", "127.0.0.1:1")));
        let err = a
            .send_to(&ServerID("zz".into()), GroupMessage::Zap { reason: "test".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }
}
