//! Global transaction sequencing
//!
//! Every server transaction gets one global id, applied at most once, and is
//! forgotten when the group's low watermark passes it.

pub mod descriptor;
pub mod manager;
pub mod store;

pub use descriptor::{DescriptorState, GlobalTransactionDescriptor};
pub use manager::GlobalTransactionManager;
pub use store::TransactionStore;
