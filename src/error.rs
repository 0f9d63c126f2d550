//! DSO Server Error Types

use thiserror::Error;

use crate::id::{GlobalTransactionID, NodeID, TransactionID};

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transaction errors
    #[error(
        "Unknown transaction {node}:{txn} with {gid} below low watermark {low_watermark}"
    )]
    UnknownTransaction {
        node: NodeID,
        txn: TransactionID,
        gid: GlobalTransactionID,
        low_watermark: GlobalTransactionID,
    },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Sequence gap from {node}: expected {expected}, got {received}")]
    SequenceGap {
        node: NodeID,
        expected: i64,
        received: i64,
    },

    // Codec errors
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("State error: {0}")]
    State(String),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Stage errors
    #[error("Stage {0} is closed")]
    StageClosed(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::Network(_) | Error::Persistence(_)
        )
    }

    /// Check if this error terminates the session of the peer that caused it
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownTransaction { .. }
                | Error::Protocol(_)
                | Error::SequenceGap { .. }
                | Error::Decode(_)
                | Error::Serialization(_)
        )
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ClientID;

    #[test]
    fn test_session_fatal_classification() {
        let unknown = Error::UnknownTransaction {
            node: NodeID::Client(ClientID(3)),
            txn: TransactionID(7),
            gid: GlobalTransactionID(10),
            low_watermark: GlobalTransactionID(20),
        };
        assert!(unknown.is_session_fatal());
        assert!(!unknown.is_retryable());

        assert!(Error::decode("bad tag").is_session_fatal());
        assert!(!Error::Persistence("disk full".into()).is_session_fatal());
        assert!(Error::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn test_unknown_transaction_message_names_identity() {
        let err = Error::UnknownTransaction {
            node: NodeID::Client(ClientID(3)),
            txn: TransactionID(7),
            gid: GlobalTransactionID(10),
            low_watermark: GlobalTransactionID(20),
        };
        let text = err.to_string();
        assert!(text.contains("ClientID[3]"));
        assert!(text.contains("TransactionID[7]"));
        assert!(text.contains("GlobalTransactionID[10]"));
    }
}
