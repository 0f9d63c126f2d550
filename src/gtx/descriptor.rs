//! Global transaction descriptors

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{GlobalTransactionID, GroupID, ServerTransactionID};

/// Apply progress of a tracked transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorState {
    /// Global id assigned by the active, apply not started
    Assigned,
    /// Apply started, not yet committed
    Applying,
    /// Applied and committed
    Applied,
}

impl DescriptorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorState::Assigned => "assigned",
            DescriptorState::Applying => "applying",
            DescriptorState::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "assigned" => Ok(DescriptorState::Assigned),
            "applying" => Ok(DescriptorState::Applying),
            "applied" => Ok(DescriptorState::Applied),
            other => Err(Error::State(format!("unknown descriptor state '{}'", other))),
        }
    }
}

/// Mapping of a server transaction to its global order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTransactionDescriptor {
    pub server_txn_id: ServerTransactionID,
    pub global_txn_id: GlobalTransactionID,
    pub group: GroupID,
    pub state: DescriptorState,
}

impl GlobalTransactionDescriptor {
    pub fn new(
        server_txn_id: ServerTransactionID,
        global_txn_id: GlobalTransactionID,
        group: GroupID,
    ) -> Self {
        Self {
            server_txn_id,
            global_txn_id,
            group,
            state: DescriptorState::Assigned,
        }
    }

    /// Move to `Applying`; true only for the first call
    pub fn initiate_apply(&mut self) -> bool {
        if self.state == DescriptorState::Assigned {
            self.state = DescriptorState::Applying;
            true
        } else {
            false
        }
    }

    pub fn is_applying(&self) -> bool {
        self.state == DescriptorState::Applying
    }

    pub fn is_applied(&self) -> bool {
        self.state == DescriptorState::Applied
    }

    pub fn mark_applied(&mut self) {
        self.state = DescriptorState::Applied;
    }
}

impl std::fmt::Display for GlobalTransactionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GlobalTransactionDescriptor[{} -> {} {} {}]",
            self.server_txn_id,
            self.global_txn_id,
            self.group,
            self.state.as_str()
        )
    }
}
