//! Identifiers
//!
//! Strongly typed identifiers used across the transaction and replication
//! core, plus a lock-free monotonic sequence for allocating them.
//!
//! All counters are signed 64-bit with `-1` as the null sentinel, matching
//! the wire format.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

macro_rules! long_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl $name {
            pub const NULL_ID: $name = $name(-1);

            pub fn as_i64(&self) -> i64 {
                self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == -1
            }

            pub fn next(&self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}[{}]", stringify!($name), self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

long_id!(
    /// Identifier of a clustered object
    ObjectID
);
long_id!(
    /// Client-local transaction counter
    TransactionID
);
long_id!(
    /// Client-local wire ordering counter
    SequenceID
);
long_id!(
    /// Server-assigned global commit order
    GlobalTransactionID
);
long_id!(
    /// Client-local commit batch counter
    TxnBatchID
);

/// Identifier of a connected client (L1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientID(pub u64);

impl std::fmt::Display for ClientID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientID[{}]", self.0)
    }
}

/// Identifier of a server (L2) in a replication group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerID(pub String);

impl std::fmt::Display for ServerID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerID[{}]", self.0)
    }
}

/// Identifier of a replication group (one active plus its passives)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct GroupID(pub u32);

impl std::fmt::Display for GroupID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupID[{}]", self.0)
    }
}

/// Source of a transaction or message: a client or another server
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeID {
    Client(ClientID),
    Server(ServerID),
}

impl NodeID {
    pub fn client_id(&self) -> Option<ClientID> {
        match self {
            NodeID::Client(id) => Some(*id),
            NodeID::Server(_) => None,
        }
    }

    /// Stable textual key used by the persistence layer
    pub fn to_key(&self) -> String {
        match self {
            NodeID::Client(id) => format!("c:{}", id.0),
            NodeID::Server(id) => format!("s:{}", id.0),
        }
    }

    /// Inverse of [`NodeID::to_key`]
    pub fn from_key(key: &str) -> Option<Self> {
        let (kind, rest) = key.split_once(':')?;
        match kind {
            "c" => rest.parse().ok().map(|v| NodeID::Client(ClientID(v))),
            "s" => Some(NodeID::Server(ServerID(rest.to_string()))),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeID::Client(id) => write!(f, "{}", id),
            NodeID::Server(id) => write!(f, "{}", id),
        }
    }
}

impl From<ClientID> for NodeID {
    fn from(id: ClientID) -> Self {
        NodeID::Client(id)
    }
}

/// A transaction as identified by the server: originating node plus the
/// node-local transaction id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerTransactionID {
    pub source: NodeID,
    pub txn: TransactionID,
}

impl ServerTransactionID {
    pub fn new(source: impl Into<NodeID>, txn: TransactionID) -> Self {
        Self {
            source: source.into(),
            txn,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txn.is_null()
    }

    /// The next transaction id from the same source
    pub fn next(&self) -> Self {
        Self {
            source: self.source.clone(),
            txn: self.txn.next(),
        }
    }
}

impl std::fmt::Display for ServerTransactionID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.txn)
    }
}

/// Named distributed lock
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockID(pub String);

impl LockID {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockID[{}]", self.0)
    }
}

/// Monotonic id sequence
///
/// Lock-free and thread-safe. `next()` hands out `current + 1`; the sequence
/// can be pushed forward (never back) when recovering persisted state.
#[derive(Debug)]
pub struct IdSequence {
    current: AtomicI64,
}

impl IdSequence {
    /// Create a sequence whose first `next()` returns `last + 1`
    pub fn new(last: i64) -> Self {
        Self {
            current: AtomicI64::new(last),
        }
    }

    /// Allocate the next value
    pub fn next(&self) -> i64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reserve `count` consecutive values, returning the half-open range
    /// `[start, end)`
    pub fn next_batch(&self, count: i64) -> (i64, i64) {
        let count = count.max(0);
        let end = self.current.fetch_add(count, Ordering::SeqCst) + count + 1;
        (end - count, end)
    }

    /// Last value handed out
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Ensure the sequence never hands out a value `<= value`
    pub fn advance_to(&self, value: i64) {
        self.current.fetch_max(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_null_ids() {
        assert!(GlobalTransactionID::NULL_ID.is_null());
        assert_eq!(GlobalTransactionID::NULL_ID.as_i64(), -1);
        assert!(!ObjectID(0).is_null());
        assert_eq!(TransactionID(4).next(), TransactionID(5));
    }

    #[test]
    fn test_node_id_key_roundtrip() {
        let client = NodeID::Client(ClientID(42));
        let server = NodeID::Server(ServerID("l2-b".into()));
        assert_eq!(NodeID::from_key(&client.to_key()), Some(client));
        assert_eq!(NodeID::from_key(&server.to_key()), Some(server));
        assert_eq!(NodeID::from_key("x:1"), None);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let seq = IdSequence::new(0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next_batch(10), (3, 13));
        assert_eq!(seq.next(), 13);
    }

    #[test]
    fn test_sequence_advance_never_regresses() {
        let seq = IdSequence::new(100);
        seq.advance_to(50);
        assert_eq!(seq.current(), 100);
        seq.advance_to(200);
        assert_eq!(seq.next(), 201);
    }

    #[test]
    fn test_concurrent_allocation() {
        let seq = Arc::new(IdSequence::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let seq = Arc::clone(&seq);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| seq.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "Duplicate id in concurrent test");
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
