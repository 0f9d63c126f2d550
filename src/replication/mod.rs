//! Replication Module
//!
//! Active/passive replication inside a server group: the group protocol,
//! the active-side sender and the passive-side replicated transaction
//! manager.

pub mod passive;
pub mod protocol;
pub mod sender;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::id::ServerID;

pub use passive::{ReplicatedTransactionManager, TransactionSink};
pub use protocol::GroupMessage;
pub use sender::ReplicationSender;

/// Role of this server in its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerRole {
    /// Coordinating the group
    Active,
    /// Passive still receiving the active's object state
    PassiveUninitialized,
    /// Passive fully in sync
    PassiveStandby,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Active => write!(f, "ACTIVE"),
            ServerRole::PassiveUninitialized => write!(f, "PASSIVE-UNINITIALIZED"),
            ServerRole::PassiveStandby => write!(f, "PASSIVE-STANDBY"),
        }
    }
}

/// Messaging between the servers of a group
#[async_trait]
pub trait GroupManager: Send + Sync {
    /// This server's id
    fn local_id(&self) -> &ServerID;

    /// Servers currently connected
    async fn members(&self) -> Vec<ServerID>;

    /// Send to every connected server
    async fn send_all(&self, msg: GroupMessage) -> Result<()>;

    async fn send_to(&self, node: &ServerID, msg: GroupMessage) -> Result<()>;

    /// Send to every connected server and collect one response from each
    async fn send_all_and_wait_for_response(
        &self,
        msg: GroupMessage,
    ) -> Result<HashMap<ServerID, GroupMessage>>;

    async fn send_to_and_wait_for_response(
        &self,
        node: &ServerID,
        msg: GroupMessage,
    ) -> Result<GroupMessage>;

    /// Tell `node` to shut down and drop it from the group
    async fn zap_node(&self, node: &ServerID, reason: &str) -> Result<()>;
}

/// Ask `node` to clear its queued object sync state before a new sync.
/// A node that does not confirm is zapped.
pub async fn publish_reset_request(
    groups: &dyn GroupManager,
    node: &ServerID,
    request_id: u64,
) -> Result<()> {
    let response = groups
        .send_to_and_wait_for_response(node, GroupMessage::ObjectSyncResetRequest { request_id })
        .await;

    match response {
        Ok(GroupMessage::ObjectSyncResetResponse { request_id: id, success: true }) if id == request_id => Ok(()),
        other => {
            let reason = format!(
                "wrong response from {} while requesting object sync reset: {:?}",
                node, other
            );
            tracing::error!("{}", reason);
            groups.zap_node(node, &reason).await?;
            Err(Error::Replication(reason))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingGroupManager;
    use super::*;

    #[tokio::test]
    async fn test_reset_request_accepted() {
        let groups = RecordingGroupManager::new(&["passive-1"]);
        publish_reset_request(&groups, &ServerID("passive-1".into()), 1)
            .await
            .unwrap();
        assert!(groups.zapped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reset_zaps_node() {
        let mut groups = RecordingGroupManager::new(&["passive-1"]);
        groups.reset_ok = false;
        let node = ServerID("passive-1".into());

        assert!(publish_reset_request(&groups, &node, 2).await.is_err());
        assert_eq!(*groups.zapped.lock().unwrap(), vec![node]);
    }
}
