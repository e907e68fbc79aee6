//! Clustering Capability - Cluster Manager and Node Selection
//!
//! A clustered runtime pairs a [`ClusterManager`] (membership, rendezvous
//! with peers) with a [`NodeSelector`] (which member receives a routable
//! message). Message routing itself lives outside the core; this module only
//! defines the two contracts and the built-in selector used when none is
//! bound.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Distributed membership and coordination.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    fn name(&self) -> &str;

    /// Identifier of the local node, valid once joined.
    fn node_id(&self) -> String;

    /// Identifiers of all current members, the local node included.
    fn nodes(&self) -> Vec<String>;

    /// Rendezvous with the other members and register this node.
    async fn join(&self) -> Result<()>;

    /// Deregister this node.
    async fn leave(&self) -> Result<()>;
}

/// Chooses the destination member for a routable message.
pub trait NodeSelector: Send + Sync {
    fn name(&self) -> &str;

    /// Called once, before the cluster is joined.
    fn init(&self, cluster_manager: Arc<dyn ClusterManager>);

    /// Target for a point-to-point message on `address`.
    fn select_for_send(&self, address: &str) -> Option<String>;

    /// Targets for a message published on `address`.
    fn select_for_publish(&self, address: &str) -> Vec<String>;
}

/// Round-robin over current members, tracked per address.
#[derive(Default)]
pub struct DefaultNodeSelector {
    cluster_manager: OnceLock<Arc<dyn ClusterManager>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl DefaultNodeSelector {
    pub const NAME: &'static str = "default";

    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self) -> Vec<String> {
        self.cluster_manager
            .get()
            .map(|cm| cm.nodes())
            .unwrap_or_default()
    }
}

impl NodeSelector for DefaultNodeSelector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(&self, cluster_manager: Arc<dyn ClusterManager>) {
        // First initialization wins; the selector belongs to one runtime.
        let _ = self.cluster_manager.set(cluster_manager);
    }

    fn select_for_send(&self, address: &str) -> Option<String> {
        let members = self.members();
        if members.is_empty() {
            return None;
        }
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(address.to_string()).or_insert(0);
        let chosen = members[*cursor % members.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }

    fn select_for_publish(&self, _address: &str) -> Vec<String> {
        self.members()
    }
}
