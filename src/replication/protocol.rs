//! Group Protocol
//!
//! Messages exchanged between the servers of a replication group.

use serde::{Deserialize, Serialize};

use crate::id::{GlobalTransactionID, GroupID, ObjectID, ServerTransactionID};
use crate::tx::{ObjectSyncTransaction, ServerTransaction};

/// Server to server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupMessage {
    // ========== Transaction Relay ==========
    /// Committed transactions relayed from the active to the passives
    RelayedCommit {
        group: GroupID,
        transactions: Vec<ServerTransaction>,
        /// Group low watermark at the time of relay
        low_watermark: GlobalTransactionID,
        /// Transactions the active has fully completed since the last relay
        completed: Vec<ServerTransactionID>,
    },

    /// Passive acknowledgment of applied relayed transactions
    TransactionAck {
        group: GroupID,
        acked: Vec<(ServerTransactionID, GlobalTransactionID)>,
    },

    /// Group low watermark advanced
    LowWatermark {
        group: GroupID,
        low_watermark: GlobalTransactionID,
    },

    // ========== Object Sync ==========
    /// Full object state for a passive that is still catching up
    ObjectSync {
        transaction: ObjectSyncTransaction,
        deleted_objects: Vec<ObjectID>,
    },

    /// Passive acknowledgment of an applied object sync transaction
    ObjectSyncAck {
        id: ServerTransactionID,
    },

    /// Ask a passive to drop queued object sync state before a new sync
    ObjectSyncResetRequest {
        request_id: u64,
    },

    /// Reply to [`GroupMessage::ObjectSyncResetRequest`]
    ObjectSyncResetResponse {
        request_id: u64,
        success: bool,
    },

    /// Every object has been synced; the passive moves to standby
    ObjectSyncComplete {
        group: GroupID,
    },

    // ========== Membership ==========
    /// Instruct a node to shut itself down
    Zap {
        reason: String,
    },
}

impl GroupMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Request id this message expects a response for
    pub fn request_id(&self) -> Option<u64> {
        match self {
            GroupMessage::ObjectSyncResetRequest { request_id } => Some(*request_id),
            _ => None,
        }
    }

    /// Request id this message answers
    pub fn response_to(&self) -> Option<u64> {
        match self {
            GroupMessage::ObjectSyncResetResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            GroupMessage::RelayedCommit { .. } => "RelayedCommit",
            GroupMessage::TransactionAck { .. } => "TransactionAck",
            GroupMessage::LowWatermark { .. } => "LowWatermark",
            GroupMessage::ObjectSync { .. } => "ObjectSync",
            GroupMessage::ObjectSyncAck { .. } => "ObjectSyncAck",
            GroupMessage::ObjectSyncResetRequest { .. } => "ObjectSyncResetRequest",
            GroupMessage::ObjectSyncResetResponse { .. } => "ObjectSyncResetResponse",
            GroupMessage::ObjectSyncComplete { .. } => "ObjectSyncComplete",
            GroupMessage::Zap { .. } => "Zap",
        }
    }
}
