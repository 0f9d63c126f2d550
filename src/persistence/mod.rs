//! Persistence Gateway
//!
//! Durable storage for global transaction descriptors, the set of clients
//! connected before a restart, and named id sequences. The transaction store
//! and the handshake manager only see these traits.

pub mod memory;
pub mod sequence;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::gtx::GlobalTransactionDescriptor;
use crate::id::{ClientID, ServerTransactionID};

pub use memory::MemoryPersistor;
pub use sequence::PersistentSequence;
pub use sqlite::SqlitePersistor;

/// Name of the global transaction id sequence
pub const GLOBAL_TXN_SEQUENCE: &str = "global_transaction_id";

/// Name of the object id sequence
pub const OBJECT_ID_SEQUENCE: &str = "object_id";

/// Name of the client (connection) id sequence
pub const CLIENT_ID_SEQUENCE: &str = "client_id";

/// Storage of global transaction descriptors
#[async_trait]
pub trait TransactionPersistor: Send + Sync {
    /// Every stored descriptor
    async fn load_all_global_transaction_descriptors(&self) -> Result<Vec<GlobalTransactionDescriptor>>;

    /// Insert or update descriptors in one write unit
    async fn save_global_transaction_descriptors(
        &self,
        descriptors: &[GlobalTransactionDescriptor],
    ) -> Result<()>;

    /// Delete descriptors in one write unit, returning how many existed
    async fn delete_all_global_transaction_descriptors(
        &self,
        ids: &[ServerTransactionID],
    ) -> Result<u64>;
}

/// Storage of the clients known to this server
#[async_trait]
pub trait ClientStatePersistor: Send + Sync {
    async fn loaded_client_ids(&self) -> Result<Vec<ClientID>>;

    async fn contains_client(&self, client: ClientID) -> Result<bool>;

    async fn save_client_state(&self, client: ClientID) -> Result<()>;

    async fn delete_client_state(&self, client: ClientID) -> Result<()>;
}

/// Storage of named monotonic sequences
#[async_trait]
pub trait SequencePersistor: Send + Sync {
    /// Reserve `count` values, returning the half-open range `[start, end)`.
    /// A fresh sequence starts at 1.
    async fn reserve(&self, name: &str, count: i64) -> Result<(i64, i64)>;

    /// Make sure the sequence never hands out a value below `value`
    async fn set_min_next(&self, name: &str, value: i64) -> Result<()>;

    /// Next value that would be reserved
    async fn peek(&self, name: &str) -> Result<i64>;
}

/// All three persistors behind one handle
pub trait Persistor: TransactionPersistor + ClientStatePersistor + SequencePersistor {}

impl<T: TransactionPersistor + ClientStatePersistor + SequencePersistor> Persistor for T {}

/// Persistence handles shared by server components
#[derive(Clone)]
pub struct PersistenceGateway {
    pub transactions: Arc<dyn TransactionPersistor>,
    pub clients: Arc<dyn ClientStatePersistor>,
    pub sequences: Arc<dyn SequencePersistor>,
    persistent: bool,
}

impl PersistenceGateway {
    /// Gateway over one persistor implementing every role
    pub fn new<P: Persistor + 'static>(persistor: Arc<P>, persistent: bool) -> Self {
        Self {
            transactions: persistor.clone(),
            clients: persistor.clone(),
            sequences: persistor,
            persistent,
        }
    }

    /// In-memory gateway (non persistent)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistor::new()), false)
    }

    /// Whether state survives a restart
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("persistent", &self.persistent)
            .finish()
    }
}
