//! Worker node registry

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A worker database node participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerNode {
    /// Node group this worker belongs to
    pub group_id: i32,
    pub host: String,
    pub port: u16,
}

impl WorkerNode {
    pub fn new(group_id: i32, host: impl Into<String>, port: u16) -> Self {
        Self {
            group_id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for WorkerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Role of a node within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Primary,
    Secondary,
}

#[derive(Debug)]
struct NodeEntry {
    node: WorkerNode,
    role: NodeRole,
    is_active: bool,
}

/// In-memory registry of the cluster's worker nodes.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: Mutex<BTreeMap<(String, u16), NodeEntry>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Re-adding an existing address updates it and marks
    /// it active again.
    pub fn add_node(&self, node: WorkerNode, role: NodeRole) {
        let key = (node.host.clone(), node.port);
        self.nodes.lock().insert(
            key,
            NodeEntry {
                node,
                role,
                is_active: true,
            },
        );
    }

    /// Mark a node inactive without forgetting it.
    pub fn disable_node(&self, host: &str, port: u16) {
        if let Some(entry) = self.nodes.lock().get_mut(&(host.to_string(), port)) {
            entry.is_active = false;
        }
    }

    pub fn remove_node(&self, host: &str, port: u16) -> Option<WorkerNode> {
        self.nodes
            .lock()
            .remove(&(host.to_string(), port))
            .map(|entry| entry.node)
    }

    /// Active primary nodes, in stable (host, port) order.
    pub fn active_primary_nodes(&self) -> Vec<WorkerNode> {
        self.nodes
            .lock()
            .values()
            .filter(|entry| entry.is_active && entry.role == NodeRole::Primary)
            .map(|entry| entry.node.clone())
            .collect()
    }
}
