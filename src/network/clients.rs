//! Client connection server
//!
//! Accepts client connections, requires a handshake as the first frame and
//! then forwards every client message to the server. Outbound messages go
//! through a per-connection writer task.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::FrameCodec;
use crate::error::{Error, Result};
use crate::handshake::{ChannelManager, ClientMessage};
use crate::id::ClientID;

/// What the client server reports
#[derive(Debug)]
pub enum ClientEvent {
    Message(ClientID, ClientMessage),
    Disconnected(ClientID),
}

/// Grace period for a closing connection's queued replies
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct Channel {
    outbound: mpsc::Sender<ClientMessage>,
    close: Option<oneshot::Sender<()>>,
    address: SocketAddr,
}

/// Live client channels
pub struct ClientServer {
    bind_address: String,
    max_frame_size: usize,
    queue_size: usize,
    channels: RwLock<HashMap<ClientID, Channel>>,
    events: mpsc::Sender<ClientEvent>,
}

impl ClientServer {
    pub fn new(
        bind_address: impl Into<String>,
        max_frame_size: usize,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (events, receiver) = mpsc::channel(queue_size.max(1));
        let server = Arc::new(Self {
            bind_address: bind_address.into(),
            max_frame_size,
            queue_size: queue_size.max(1),
            channels: RwLock::new(HashMap::new()),
            events,
        });
        (server, receiver)
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let local = listener.local_addr()?;
        tracing::info!("Client server listening on {}", local);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop(listener, shutdown).await });
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_connection(socket, addr).await {
                                    tracing::warn!("Client connection {} failed: {}", addr, e);
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
        self.close_everything().await;
        tracing::info!("Client server stopped");
    }

    async fn handle_connection(&self, socket: TcpStream, addr: SocketAddr) -> Result<()> {
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new(self.max_frame_size));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(self.max_frame_size));

        let first = match frames.next().await {
            Some(frame) => ClientMessage::deserialize(&frame?)?,
            None => return Ok(()),
        };
        let client = match &first {
            ClientMessage::Handshake(handshake) => handshake.client_id,
            other => {
                let refusal = ClientMessage::HandshakeRefused {
                    reason: format!("expected Handshake, got {}", other.type_name()),
                };
                writer.send(Bytes::from(refusal.serialize()?)).await?;
                return Err(Error::Protocol(format!(
                    "{} sent {} before handshaking",
                    addr,
                    other.type_name()
                )));
            }
        };

        let (outbound, mut queue) = mpsc::channel::<ClientMessage>(self.queue_size);
        let (close_tx, mut close_rx) = oneshot::channel();
        let replaced = self.channels.write().await.insert(
            client,
            Channel {
                outbound,
                close: Some(close_tx),
                address: addr,
            },
        );
        if let Some(mut old) = replaced {
            tracing::warn!(%client, "Client reconnected, closing previous channel from {}", old.address);
            if let Some(close) = old.close.take() {
                let _ = close.send(());
            }
        }
        tracing::debug!(%client, "Client channel open from {}", addr);

        let mut writer_task = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let refused = matches!(message, ClientMessage::HandshakeRefused { .. });
                let bytes = match message.serialize() {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        tracing::error!(%client, "Failed to encode {}: {}", message.type_name(), e);
                        continue;
                    }
                };
                if writer.send(bytes).await.is_err() || refused {
                    break;
                }
            }
        });

        let mut result = self.forward(client, first).await;
        if result.is_ok() {
            result = loop {
                tokio::select! {
                    frame = frames.next() => match frame {
                        Some(Ok(bytes)) => {
                            let message = match ClientMessage::deserialize(&bytes) {
                                Ok(message) => message,
                                Err(e) => break Err(e.into()),
                            };
                            if let Err(e) = self.forward(client, message).await {
                                break Err(e);
                            }
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    },
                    _ = &mut close_rx => break Ok(()),
                }
            };
        }

        let current = self.unregister(client, addr).await;
        // Our sender is gone with the channel; let queued replies flush
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            writer_task.abort();
        }
        if current {
            let _ = self.events.send(ClientEvent::Disconnected(client)).await;
            tracing::debug!(%client, "Client channel closed");
        } else {
            tracing::debug!(%client, "Superseded client channel from {} closed", addr);
        }
        result
    }

    async fn forward(&self, client: ClientID, message: ClientMessage) -> Result<()> {
        self.events
            .send(ClientEvent::Message(client, message))
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Drop the channel registered from `addr`. False when a newer
    /// connection of the same client has taken its place.
    async fn unregister(&self, client: ClientID, addr: SocketAddr) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get(&client).map(|c| c.address) {
            Some(registered) if registered == addr => {
                channels.remove(&client);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    fn close_channel(client: ClientID, mut channel: Channel, reason: String) {
        tracing::info!(%client, reason = %reason, "Closing client channel");
        let _ = channel
            .outbound
            .try_send(ClientMessage::HandshakeRefused { reason });
        if let Some(close) = channel.close.take() {
            let _ = close.send(());
        }
    }

    async fn close_everything(&self) {
        let mut channels = self.channels.write().await;
        for (_, mut channel) in channels.drain() {
            if let Some(close) = channel.close.take() {
                let _ = close.send(());
            }
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[async_trait]
impl ChannelManager for ClientServer {
    async fn close_all(&self, clients: &[ClientID]) {
        let mut channels = self.channels.write().await;
        for client in clients {
            if let Some(channel) = channels.remove(client) {
                Self::close_channel(*client, channel, "connection closed by server".into());
            }
        }
    }

    async fn refuse(&self, client: ClientID, reason: String) {
        if let Some(channel) = self.channels.write().await.remove(&client) {
            Self::close_channel(client, channel, reason);
        }
    }

    /// Queue a message for a connected client
    async fn send(&self, client: ClientID, message: ClientMessage) -> Result<()> {
        let outbound = {
            let channels = self.channels.read().await;
            let channel = channels
                .get(&client)
                .ok_or_else(|| Error::Network(format!("{} is not connected", client)))?;
            channel.outbound.clone()
        };
        outbound
            .send(message)
            .await
            .map_err(|_| Error::Network(format!("channel to {} is closed", client)))
    }

    async fn active_clients(&self) -> Vec<ClientID> {
        self.channels.read().await.keys().copied().collect()
    }

    async fn is_connected(&self, client: ClientID) -> bool {
        self.channels.read().await.contains_key(&client)
    }
}
