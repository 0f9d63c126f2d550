//! Server-side transaction records

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::dna::Dna;
use crate::error::{Error, Result};
use crate::id::{
    GlobalTransactionID, LockID, NodeID, ObjectID, SequenceID, ServerTransactionID, TransactionID,
    TxnBatchID,
};

/// Lock type a transaction ran under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnType {
    Normal,
    Concurrent,
    SyncWrite,
}

impl TxnType {
    /// Wire byte
    pub fn code(self) -> u8 {
        match self {
            TxnType::Normal => 1,
            TxnType::Concurrent => 2,
            TxnType::SyncWrite => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(TxnType::Normal),
            2 => Ok(TxnType::Concurrent),
            3 => Ok(TxnType::SyncWrite),
            other => Err(Error::decode(format!("unknown transaction type {}", other))),
        }
    }
}

/// How a transaction reached the apply pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOrigin {
    /// Committed by a client, possibly relayed by the active
    Committed,
    /// A relayed transaction with changes for unknown objects removed
    Pruned,
    /// Object sync state merged with buffered deltas
    ObjectSync,
}

/// Wake-up of threads waiting on a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub lock_id: LockID,
    pub thread_id: i64,
    pub all: bool,
}

/// Distributed method invocation carried alongside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmiDescriptor {
    pub receiver: ObjectID,
    pub dmi_call: ObjectID,
    pub fault_receiver: bool,
}

/// The server-side transaction envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerTransaction {
    pub batch_id: TxnBatchID,
    pub transaction_id: TransactionID,
    pub sequence_id: SequenceID,
    pub source: NodeID,
    pub lock_ids: Vec<LockID>,
    pub changes: Vec<Dna>,
    pub new_roots: BTreeMap<String, ObjectID>,
    pub notifies: Vec<Notify>,
    pub dmis: Vec<DmiDescriptor>,
    pub txn_type: TxnType,
    /// Number of application transactions folded into this one
    pub num_application_txn: i32,
    pub is_eviction: bool,
    pub is_resent: bool,
    pub global_txn_id: GlobalTransactionID,
    pub origin: TxnOrigin,
}

impl ServerTransaction {
    /// A committed transaction with no gid assigned yet
    pub fn new(
        source: impl Into<NodeID>,
        batch_id: TxnBatchID,
        transaction_id: TransactionID,
        sequence_id: SequenceID,
        changes: Vec<Dna>,
    ) -> Self {
        Self {
            batch_id,
            transaction_id,
            sequence_id,
            source: source.into(),
            lock_ids: Vec::new(),
            changes,
            new_roots: BTreeMap::new(),
            notifies: Vec::new(),
            dmis: Vec::new(),
            txn_type: TxnType::Normal,
            num_application_txn: 1,
            is_eviction: false,
            is_resent: false,
            global_txn_id: GlobalTransactionID::NULL_ID,
            origin: TxnOrigin::Committed,
        }
    }

    pub fn with_global_txn_id(mut self, gid: GlobalTransactionID) -> Self {
        self.global_txn_id = gid;
        self
    }

    pub fn with_locks(mut self, locks: Vec<LockID>) -> Self {
        self.lock_ids = locks;
        self
    }

    pub fn server_transaction_id(&self) -> ServerTransactionID {
        ServerTransactionID {
            source: self.source.clone(),
            txn: self.transaction_id,
        }
    }

    /// Every object this transaction writes
    pub fn object_ids(&self) -> BTreeSet<ObjectID> {
        self.changes.iter().map(|dna| dna.object_id()).collect()
    }

    /// Objects created (non-delta DNA) by this transaction
    pub fn new_object_ids(&self) -> BTreeSet<ObjectID> {
        self.changes
            .iter()
            .filter(|dna| !dna.is_delta())
            .map(|dna| dna.object_id())
            .collect()
    }

    /// Copy of this transaction carrying only `changes`
    pub fn pruned(&self, changes: Vec<Dna>) -> Self {
        Self {
            changes,
            origin: TxnOrigin::Pruned,
            ..self.clone_envelope()
        }
    }

    pub fn is_object_sync(&self) -> bool {
        self.origin == TxnOrigin::ObjectSync
    }

    /// Decode every change once; a malformed action fails here instead of
    /// after the transaction has been sequenced
    pub fn validate_changes(&self) -> Result<()> {
        for dna in &self.changes {
            dna.actions().map_err(|e| {
                Error::decode(format!("{} change to {}: {}", self.server_transaction_id(), dna.object_id(), e))
            })?;
        }
        Ok(())
    }

    /// Everything but the change list
    fn clone_envelope(&self) -> Self {
        Self {
            batch_id: self.batch_id,
            transaction_id: self.transaction_id,
            sequence_id: self.sequence_id,
            source: self.source.clone(),
            lock_ids: self.lock_ids.clone(),
            changes: Vec::new(),
            new_roots: self.new_roots.clone(),
            notifies: self.notifies.clone(),
            dmis: self.dmis.clone(),
            txn_type: self.txn_type,
            num_application_txn: self.num_application_txn,
            is_eviction: self.is_eviction,
            is_resent: self.is_resent,
            global_txn_id: self.global_txn_id,
            origin: self.origin,
        }
    }
}

/// Full object state streamed from the active to a joining passive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSyncTransaction {
    pub id: ServerTransactionID,
    pub changes: Vec<Dna>,
    pub root_names: BTreeMap<String, ObjectID>,
}

impl ObjectSyncTransaction {
    pub fn new(id: ServerTransactionID, changes: Vec<Dna>) -> Self {
        Self {
            id,
            changes,
            root_names: BTreeMap::new(),
        }
    }

    /// Apply-pipeline form carrying `changes`
    pub fn to_server_transaction(&self, changes: Vec<Dna>) -> ServerTransaction {
        let mut txn = ServerTransaction::new(
            self.id.source.clone(),
            TxnBatchID::NULL_ID,
            self.id.txn,
            SequenceID::NULL_ID,
            changes,
        );
        txn.new_roots = self.root_names.clone();
        txn.origin = TxnOrigin::ObjectSync;
        txn
    }
}
