//! DSO Server - Distributed Shared Object Server Core
//!
//! The server side of a distributed shared-object system: clients commit
//! batches of object changes (DNA), the active server of a group assigns each
//! transaction a global commit order, applies it at most once and relays it
//! to passive servers, which reproduce the same state.
//!
//! # Architecture
//!
//! One active server per group coordinates all commits; passives follow it.
//! A passive that joins late buffers changes for objects it has not received
//! yet and merges them behind the object's full state once it arrives.
//!
//! # Features
//!
//! - Self-describing DNA codec for object state and deltas
//! - Global transaction sequencer with persisted descriptors
//! - Low watermark driven cleanup across the group
//! - Client reconnect window with transaction replay after a restart
//! - Staged pipelines with per-client ordering

pub mod config;
pub mod dna;
pub mod error;
pub mod gtx;
pub mod handshake;
pub mod id;
pub mod network;
pub mod persistence;
pub mod replication;
pub mod server;
pub mod stage;
pub mod tuning;
pub mod tx;

pub use config::DsoConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DsoConfig;
    pub use crate::dna::Dna;
    pub use crate::error::{Error, Result};
    pub use crate::gtx::GlobalTransactionManager;
    pub use crate::id::{GlobalTransactionID, ObjectID, ServerTransactionID};
    pub use crate::replication::{GroupMessage, ReplicatedTransactionManager, ServerRole};
    pub use crate::server::DsoServer;
    pub use crate::tx::{CommitBatch, ServerTransaction};
}
