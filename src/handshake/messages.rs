//! Client protocol messages

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{ClientID, ObjectID, SequenceID, ServerID, TransactionID, TxnBatchID};
use crate::tx::ServerTransaction;

/// Sent by a client when it (re)connects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHandshake {
    pub client_id: ClientID,
    pub client_version: String,
    pub address: String,
    pub uuid: Uuid,
    /// Sequence ids of transactions the client has not seen acknowledged
    pub sequence_ids: Vec<SequenceID>,
    /// Transactions the client sent before a server restart
    pub resend_transactions: Vec<ServerTransaction>,
    pub object_ids_requested: bool,
}

impl ClientHandshake {
    pub fn new(client_id: ClientID, address: impl Into<String>) -> Self {
        Self {
            client_id,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            address: address.into(),
            uuid: Uuid::new_v4(),
            sequence_ids: Vec::new(),
            resend_transactions: Vec::new(),
            object_ids_requested: false,
        }
    }

    /// Lowest outstanding sequence id
    pub fn min_sequence_id(&self) -> Option<SequenceID> {
        self.sequence_ids.iter().min().copied()
    }
}

/// Server reply once the client may proceed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub connection_id: ClientID,
    pub server_id: ServerID,
    /// Whether the server keeps state across restarts
    pub persistent: bool,
    /// Object ids reserved for this client, `[start, end)`
    pub object_id_range: Option<(ObjectID, ObjectID)>,
}

/// Messages on a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Handshake(ClientHandshake),

    HandshakeAck(HandshakeAck),

    /// Handshake refused; the server closes the connection
    HandshakeRefused { reason: String },

    /// Encoded commit batch; `low_watermark` is the client's lowest
    /// transaction id not yet acknowledged to it
    CommitTransactions {
        batch: Vec<u8>,
        low_watermark: TransactionID,
    },

    /// Transactions of a batch applied
    TransactionsCommitted {
        batch_id: TxnBatchID,
        transaction_ids: Vec<TransactionID>,
    },
}

impl ClientMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Handshake(_) => "Handshake",
            ClientMessage::HandshakeAck(_) => "HandshakeAck",
            ClientMessage::HandshakeRefused { .. } => "HandshakeRefused",
            ClientMessage::CommitTransactions { .. } => "CommitTransactions",
            ClientMessage::TransactionsCommitted { .. } => "TransactionsCommitted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let mut handshake = ClientHandshake::new(ClientID(4), "10.0.0.4:53000");
        handshake.sequence_ids = vec![SequenceID(12), SequenceID(10), SequenceID(11)];
        handshake.object_ids_requested = true;

        let bytes = ClientMessage::Handshake(handshake.clone()).serialize().unwrap();
        match ClientMessage::deserialize(&bytes).unwrap() {
            ClientMessage::Handshake(restored) => {
                assert_eq!(restored, handshake);
                assert_eq!(restored.min_sequence_id(), Some(SequenceID(10)));
            }
            other => panic!("Wrong message type {}", other.type_name()),
        }
    }
}
