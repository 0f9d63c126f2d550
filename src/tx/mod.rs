//! Transactions
//!
//! The server-side transaction envelope and the client commit batch codec.

pub mod batch;
pub mod record;

pub use batch::CommitBatch;
pub use record::{
    DmiDescriptor, Notify, ObjectSyncTransaction, ServerTransaction, TxnOrigin, TxnType,
};
