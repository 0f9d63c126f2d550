//! Server Client Handshake Manager
//!
//! After a restart the server waits for every client it knew about to
//! reconnect (or for the reconnect window to close) before it starts
//! processing new work. Resent transactions are replayed on reconnect and
//! the sequencer makes sure each is applied once.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{ClientHandshake, ClientMessage, HandshakeAck};
use super::sequence::SequenceValidator;
use crate::error::{Error, Result};
use crate::id::{ClientID, ObjectID, ServerID};
use crate::persistence::{ClientStatePersistor, PersistentSequence};
use crate::tx::ServerTransaction;

/// Client connections as seen by the server
#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// Close the connections of `clients`
    async fn close_all(&self, clients: &[ClientID]);

    /// Tell `client` why, then close its connection
    async fn refuse(&self, client: ClientID, reason: String) {
        debug!(client = %client, reason = %reason, "Refusing client");
        self.close_all(&[client]).await;
    }

    async fn send(&self, client: ClientID, message: ClientMessage) -> Result<()>;

    async fn send_ack(&self, client: ClientID, ack: HandshakeAck) -> Result<()> {
        self.send(client, ClientMessage::HandshakeAck(ack)).await
    }

    async fn active_clients(&self) -> Vec<ClientID>;

    async fn is_connected(&self, client: ClientID) -> bool {
        self.active_clients().await.contains(&client)
    }
}

/// Where reconnecting clients hand their work over
#[async_trait]
pub trait HandshakeSink: Send + Sync {
    /// Replay transactions a client sent before the restart
    async fn resend(&self, client: ClientID, transactions: Vec<ServerTransaction>) -> Result<()>;

    /// Every known client is back; release the pipeline
    async fn start(&self) -> Result<()>;
}

/// Callback run when the reconnect window closes
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// One-shot timer for the reconnect window
pub trait ReconnectTimer: Send + Sync {
    fn schedule(&self, delay: Duration, on_fire: TimerCallback);

    /// Idempotent
    fn cancel(&self);
}

/// [`ReconnectTimer`] backed by a tokio task
#[derive(Debug, Default)]
pub struct TokioReconnectTimer {
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TokioReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconnectTimer for TokioReconnectTimer {
    fn schedule(&self, delay: Duration, on_fire: TimerCallback) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        });
        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    fn cancel(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Starting,
    Started,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    /// Clients expected to reconnect
    pending: BTreeSet<ClientID>,
    deferred_acks: Vec<(ClientID, HandshakeAck)>,
    /// Handshakes replaying their resent transactions outside the lock
    connecting: usize,
    timer_scheduled: bool,
}

impl Inner {
    fn ready_to_start(&self) -> bool {
        self.phase == Phase::Starting && self.pending.is_empty() && self.connecting == 0
    }
}

/// Collaborators of the handshake manager
pub struct HandshakeContext {
    pub server_id: ServerID,
    pub persistent: bool,
    pub channels: Arc<dyn ChannelManager>,
    pub sink: Arc<dyn HandshakeSink>,
    pub clients: Arc<dyn ClientStatePersistor>,
    pub sequence_validator: Arc<SequenceValidator>,
    pub object_ids: Arc<PersistentSequence>,
    pub timer: Arc<dyn ReconnectTimer>,
    /// `None` disables the reconnect window
    pub reconnect_timeout: Option<Duration>,
    pub object_id_batch_size: i64,
}

/// Gate between "clients reconnecting" and "server started"
pub struct ServerClientHandshakeManager {
    ctx: HandshakeContext,
    inner: Mutex<Inner>,
    this: Weak<ServerClientHandshakeManager>,
}

impl ServerClientHandshakeManager {
    pub fn new(ctx: HandshakeContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx,
            inner: Mutex::new(Inner {
                phase: Phase::NotStarted,
                pending: BTreeSet::new(),
                deferred_acks: Vec::new(),
                connecting: 0,
                timer_scheduled: false,
            }),
            this: this.clone(),
        })
    }

    /// Begin waiting for `existing` clients. An empty set starts at once.
    pub async fn set_starting(&self, existing: impl IntoIterator<Item = ClientID>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::NotStarted {
            return Err(Error::IllegalState("handshake manager already starting".into()));
        }
        inner.pending = existing.into_iter().collect();
        inner.phase = Phase::Starting;
        info!(clients = inner.pending.len(), "Waiting for clients to reconnect");

        if inner.pending.is_empty() {
            self.start(&mut inner).await?;
        }
        Ok(())
    }

    /// Seed the pending set from the persisted client table
    pub async fn set_starting_from_persisted(&self) -> Result<()> {
        let existing = self.ctx.clients.loaded_client_ids().await?;
        self.set_starting(existing).await
    }

    pub async fn is_starting(&self) -> bool {
        self.inner.lock().await.phase == Phase::Starting
    }

    pub async fn is_started(&self) -> bool {
        self.inner.lock().await.phase == Phase::Started
    }

    /// Clients still expected to reconnect
    pub async fn pending_clients(&self) -> Vec<ClientID> {
        self.inner.lock().await.pending.iter().copied().collect()
    }

    /// A client connected and sent its handshake.
    ///
    /// Resent transactions are handed to the sink without holding the
    /// manager lock; the server does not start until every handshake in
    /// progress has queued its replay.
    pub async fn notify_client_connect(&self, handshake: ClientHandshake) -> Result<()> {
        let client = handshake.client_id;
        let (ack, resent) = {
            let mut inner = self.inner.lock().await;

            match inner.phase {
                Phase::NotStarted => {
                    return Err(Error::IllegalState(format!(
                        "handshake from {} before the server is starting",
                        client
                    )));
                }
                Phase::Starting if !inner.pending.contains(&client) => {
                    warn!(client = %client, address = %handshake.address, "Refusing client that is not reconnecting");
                    self.ctx.channels.close_all(&[client]).await;
                    return Err(Error::Protocol(format!(
                        "{} is not allowed to connect while the server is starting",
                        client
                    )));
                }
                _ => {}
            }

            debug!(
                client = %client,
                version = %handshake.client_version,
                uuid = %handshake.uuid,
                resent = handshake.resend_transactions.len(),
                "Client handshake"
            );

            self.ctx
                .sequence_validator
                .initialize(client, &handshake.sequence_ids)
                .await;

            if !self.ctx.clients.contains_client(client).await? {
                self.ctx.clients.save_client_state(client).await?;
            }

            let ack = self.ack_for(client, handshake.object_ids_requested).await?;

            if inner.phase == Phase::Starting {
                self.schedule_timer(&mut inner);
                inner.pending.remove(&client);
            }
            inner.connecting += 1;

            let resent: Vec<ServerTransaction> = handshake
                .resend_transactions
                .into_iter()
                .map(|mut txn| {
                    txn.is_resent = true;
                    txn
                })
                .collect();
            (ack, resent)
        };

        let replayed = if resent.is_empty() {
            Ok(())
        } else {
            self.ctx.sink.resend(client, resent).await
        };

        let mut inner = self.inner.lock().await;
        inner.connecting -= 1;
        let outcome = match replayed {
            Ok(()) if inner.phase == Phase::Started => self.ctx.channels.send_ack(client, ack).await,
            Ok(()) => {
                inner.deferred_acks.push((client, ack));
                Ok(())
            }
            Err(e) => Err(e),
        };
        if inner.ready_to_start() {
            self.start(&mut inner).await?;
        }
        outcome
    }

    fn schedule_timer(&self, inner: &mut Inner) {
        if inner.timer_scheduled {
            return;
        }
        if let Some(timeout) = self.ctx.reconnect_timeout {
            let this = self.this.clone();
            self.ctx.timer.schedule(
                timeout,
                Box::new(move || {
                    if let Some(manager) = this.upgrade() {
                        tokio::spawn(async move { manager.notify_timeout().await });
                    }
                }),
            );
            inner.timer_scheduled = true;
            info!(timeout_ms = timeout.as_millis() as u64, "Reconnect window opened");
        }
    }

    /// The reconnect window closed; clients still missing are lost
    pub async fn notify_timeout(&self) {
        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Starting {
            return;
        }

        let lost: Vec<ClientID> = std::mem::take(&mut inner.pending).into_iter().collect();
        if !lost.is_empty() {
            warn!(clients = ?lost, "Reconnect window closed, closing clients that did not reconnect");
            self.ctx.channels.close_all(&lost).await;
            for client in &lost {
                if let Err(e) = self.ctx.clients.delete_client_state(*client).await {
                    warn!(client = %client, "Failed to delete client state: {}", e);
                }
            }
        }

        if inner.connecting > 0 {
            debug!(connecting = inner.connecting, "Start deferred to handshakes in progress");
            return;
        }
        if let Err(e) = self.start(&mut inner).await {
            warn!("Failed to start after reconnect timeout: {}", e);
        }
    }

    async fn start(&self, inner: &mut Inner) -> Result<()> {
        self.ctx.timer.cancel();
        inner.phase = Phase::Started;
        info!("All clients reconnected, server started");

        self.ctx.sink.start().await?;

        for (client, ack) in std::mem::take(&mut inner.deferred_acks) {
            if let Err(e) = self.ctx.channels.send_ack(client, ack).await {
                warn!(client = %client, "Failed to send handshake ack: {}", e);
            }
        }
        Ok(())
    }

    async fn ack_for(&self, client: ClientID, object_ids_requested: bool) -> Result<HandshakeAck> {
        let object_id_range = if object_ids_requested {
            let (start, end) = self
                .ctx
                .object_ids
                .next_batch(self.ctx.object_id_batch_size)
                .await?;
            Some((ObjectID(start), ObjectID(end)))
        } else {
            None
        };

        Ok(HandshakeAck {
            connection_id: client,
            server_id: self.ctx.server_id.clone(),
            persistent: self.ctx.persistent,
            object_id_range,
        })
    }
}

impl std::fmt::Debug for ServerClientHandshakeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClientHandshakeManager")
            .field("server_id", &self.ctx.server_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{SequenceID, TransactionID, TxnBatchID};
    use crate::persistence::{MemoryPersistor, OBJECT_ID_SEQUENCE};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct TestChannels {
        closed: StdMutex<Vec<ClientID>>,
        acks: StdMutex<HashMap<ClientID, Vec<HandshakeAck>>>,
    }

    #[async_trait]
    impl ChannelManager for TestChannels {
        async fn close_all(&self, clients: &[ClientID]) {
            self.closed.lock().unwrap().extend_from_slice(clients);
        }

        async fn send(&self, client: ClientID, message: ClientMessage) -> Result<()> {
            match message {
                ClientMessage::HandshakeAck(ack) => {
                    self.acks.lock().unwrap().entry(client).or_default().push(ack);
                    Ok(())
                }
                other => Err(Error::Network(format!("unexpected {} to {}", other.type_name(), client))),
            }
        }

        async fn active_clients(&self) -> Vec<ClientID> {
            self.acks.lock().unwrap().keys().copied().collect()
        }
    }

    #[derive(Default)]
    struct TestSink {
        resent: StdMutex<Vec<(ClientID, Vec<ServerTransaction>)>>,
        starts: StdMutex<usize>,
        /// When set, `resend` waits for `release` after signalling `entered`
        hold_resend: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HandshakeSink for TestSink {
        async fn resend(&self, client: ClientID, transactions: Vec<ServerTransaction>) -> Result<()> {
            if self.hold_resend.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.resent.lock().unwrap().push((client, transactions));
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            *self.starts.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestTimer {
        scheduled: StdMutex<Vec<(Duration, Option<TimerCallback>)>>,
        cancels: StdMutex<usize>,
    }

    impl TestTimer {
        fn schedule_count(&self) -> usize {
            self.scheduled.lock().unwrap().len()
        }

        fn cancel_count(&self) -> usize {
            *self.cancels.lock().unwrap()
        }

        fn fire(&self) {
            let callback = {
                let mut scheduled = self.scheduled.lock().unwrap();
                scheduled[0].1.take()
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    impl ReconnectTimer for TestTimer {
        fn schedule(&self, delay: Duration, on_fire: TimerCallback) {
            self.scheduled.lock().unwrap().push((delay, Some(on_fire)));
        }

        fn cancel(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }

    struct Harness {
        manager: Arc<ServerClientHandshakeManager>,
        channels: Arc<TestChannels>,
        sink: Arc<TestSink>,
        timer: Arc<TestTimer>,
        validator: Arc<SequenceValidator>,
    }

    const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    fn harness(reconnect_timeout: Option<Duration>) -> Harness {
        let persistor = Arc::new(MemoryPersistor::new());
        let channels = Arc::new(TestChannels::default());
        let sink = Arc::new(TestSink::default());
        let timer = Arc::new(TestTimer::default());
        let validator = Arc::new(SequenceValidator::new(0));
        let manager = ServerClientHandshakeManager::new(HandshakeContext {
            server_id: ServerID("l2-a".into()),
            persistent: true,
            channels: channels.clone(),
            sink: sink.clone(),
            clients: persistor.clone(),
            sequence_validator: validator.clone(),
            object_ids: Arc::new(PersistentSequence::new(OBJECT_ID_SEQUENCE, persistor, 1000)),
            timer: timer.clone(),
            reconnect_timeout,
            object_id_batch_size: 1000,
        });
        Harness {
            manager,
            channels,
            sink,
            timer,
            validator,
        }
    }

    fn handshake(client: u64) -> ClientHandshake {
        let mut handshake = ClientHandshake::new(ClientID(client), "127.0.0.1:40000");
        handshake.sequence_ids = vec![SequenceID(1)];
        handshake
    }

    fn acks_for(h: &Harness, client: u64) -> Vec<HandshakeAck> {
        h.channels
            .acks
            .lock()
            .unwrap()
            .get(&ClientID(client))
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_no_unconnected_clients() {
        let h = harness(Some(RECONNECT_TIMEOUT));
        h.manager.set_starting([]).await.unwrap();
        assert!(h.manager.is_started().await);
        assert_eq!(*h.sink.starts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timer_fires_and_closes_missing_clients() {
        let h = harness(Some(RECONNECT_TIMEOUT));
        h.manager
            .set_starting([ClientID(100), ClientID(101)])
            .await
            .unwrap();

        h.manager.notify_client_connect(handshake(100)).await.unwrap();
        assert_eq!(h.timer.schedule_count(), 1);
        assert_eq!(h.timer.cancel_count(), 0);

        h.timer.fire();
        for _ in 0..100 {
            if h.manager.is_started().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(h.manager.is_started().await);
        assert_eq!(h.timer.cancel_count(), 1);
        assert_eq!(*h.channels.closed.lock().unwrap(), vec![ClientID(101)]);
        assert_eq!(acks_for(&h, 100).len(), 1);
    }

    #[tokio::test]
    async fn test_notify_timeout_closes_all_pending() {
        let h = harness(Some(RECONNECT_TIMEOUT));
        h.manager.set_starting([ClientID(1), ClientID(2)]).await.unwrap();
        assert!(!h.manager.is_started().await);

        h.manager.notify_timeout().await;
        let mut closed = h.channels.closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, vec![ClientID(1), ClientID(2)]);
        assert!(h.manager.is_started().await);

        // Idempotent
        h.manager.notify_timeout().await;
        assert_eq!(h.channels.closed.lock().unwrap().len(), 2);
        assert_eq!(*h.sink.starts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_basic_reconnect() {
        let h = harness(Some(RECONNECT_TIMEOUT));
        h.manager
            .set_starting([ClientID(100), ClientID(101)])
            .await
            .unwrap();
        assert!(h.manager.is_starting().await);

        let mut first = handshake(100);
        first.sequence_ids = vec![SequenceID(10)];
        first.resend_transactions = vec![ServerTransaction::new(
            ClientID(100),
            TxnBatchID(1),
            TransactionID(5),
            SequenceID(10),
            vec![],
        )];
        assert!(!h.validator.is_next(ClientID(100), SequenceID(10)).await);

        h.manager.notify_client_connect(first).await.unwrap();
        assert!(h.manager.is_starting().await);
        assert_eq!(h.timer.schedule_count(), 1);
        assert_eq!(h.timer.scheduled.lock().unwrap()[0].0, RECONNECT_TIMEOUT);
        assert!(h.validator.is_next(ClientID(100), SequenceID(10)).await);

        let resent = h.sink.resent.lock().unwrap().clone();
        assert_eq!(resent.len(), 1);
        assert!(resent[0].1[0].is_resent);

        // Acks are deferred until started
        assert!(acks_for(&h, 100).is_empty());
        assert_eq!(h.timer.cancel_count(), 0);

        h.manager.notify_client_connect(handshake(101)).await.unwrap();
        assert!(h.manager.is_started().await);
        assert_eq!(h.timer.cancel_count(), 1);

        // New client after start is acked right away
        h.manager.notify_client_connect(handshake(102)).await.unwrap();
        for client in [100, 101, 102] {
            assert_eq!(acks_for(&h, client).len(), 1, "acks for client {}", client);
        }
    }

    #[tokio::test]
    async fn test_object_ids_in_handshake() {
        let h = harness(Some(RECONNECT_TIMEOUT));
        h.manager
            .set_starting([ClientID(100), ClientID(101)])
            .await
            .unwrap();

        let mut first = handshake(100);
        first.object_ids_requested = true;
        h.manager.notify_client_connect(first).await.unwrap();
        h.manager.notify_client_connect(handshake(101)).await.unwrap();

        let mut late = handshake(102);
        late.object_ids_requested = true;
        h.manager.notify_client_connect(late).await.unwrap();

        assert_eq!(acks_for(&h, 101)[0].object_id_range, None);
        for client in [100, 102] {
            let (start, end) = acks_for(&h, client)[0].object_id_range.unwrap();
            assert!(start < end);
        }
        let a = acks_for(&h, 100)[0].object_id_range.unwrap();
        let b = acks_for(&h, 102)[0].object_id_range.unwrap();
        assert!(a.1 <= b.0);
    }

    #[tokio::test]
    async fn test_unknown_client_refused_while_starting() {
        let h = harness(None);
        h.manager.set_starting([ClientID(1)]).await.unwrap();

        let err = h.manager.notify_client_connect(handshake(9)).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(*h.channels.closed.lock().unwrap(), vec![ClientID(9)]);

        // Without a reconnect window the last client starts the server
        h.manager.notify_client_connect(handshake(1)).await.unwrap();
        assert!(h.manager.is_started().await);
        assert_eq!(h.timer.schedule_count(), 0);
    }

    fn resending(client: u64) -> ClientHandshake {
        let mut handshake = handshake(client);
        handshake.resend_transactions = vec![ServerTransaction::new(
            ClientID(client),
            TxnBatchID(1),
            TransactionID(1),
            SequenceID(1),
            vec![],
        )];
        handshake
    }

    #[tokio::test]
    async fn test_resend_does_not_block_the_manager() {
        let h = harness(Some(RECONNECT_TIMEOUT));
        h.manager
            .set_starting([ClientID(100), ClientID(101)])
            .await
            .unwrap();
        h.sink.hold_resend.store(true, Ordering::SeqCst);

        let manager = h.manager.clone();
        let connect = tokio::spawn(async move { manager.notify_client_connect(resending(100)).await });
        h.sink.entered.notified().await;

        // The window closes while the replay is still queued up
        tokio::time::timeout(Duration::from_secs(1), h.manager.notify_timeout())
            .await
            .expect("manager lock held across resend");
        assert_eq!(*h.channels.closed.lock().unwrap(), vec![ClientID(101)]);
        assert!(!h.manager.is_started().await);
        assert!(h.manager.pending_clients().await.is_empty());

        h.sink.release.notify_one();
        connect.await.unwrap().unwrap();

        assert!(h.manager.is_started().await);
        assert_eq!(*h.sink.starts.lock().unwrap(), 1);
        assert_eq!(h.sink.resent.lock().unwrap().len(), 1);
        assert_eq!(acks_for(&h, 100).len(), 1);
    }
}
