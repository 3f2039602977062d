//! Node Records
//!
//! In-memory representation of one registered cluster member.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use super::session::SessionTable;
use super::TableLock;
use crate::xid::TransactionId;

/// Role of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Plans and routes queries
    Coordinator,
    /// Stores data
    Datanode,
    /// Multiplexes manager connections
    Proxy,
}

impl NodeType {
    /// Only coordinators and data nodes hold snapshots, so only they take
    /// part in the global xmin computation
    pub fn reports_xmin(&self) -> bool {
        matches!(self, NodeType::Coordinator | NodeType::Datanode)
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            NodeType::Coordinator => 1,
            NodeType::Datanode => 2,
            NodeType::Proxy => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(NodeType::Coordinator),
            2 => Some(NodeType::Datanode),
            3 => Some(NodeType::Proxy),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Coordinator => write!(f, "COORDINATOR"),
            NodeType::Datanode => write!(f, "DATANODE"),
            NodeType::Proxy => write!(f, "PROXY"),
        }
    }
}

/// Connection status of a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Connected,
    Disconnected,
}

impl NodeStatus {
    pub fn as_u32(&self) -> u32 {
        match self {
            NodeStatus::Connected => 0,
            NodeStatus::Disconnected => 1,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NodeStatus::Connected),
            1 => Some(NodeStatus::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Connected => write!(f, "CONNECTED"),
            NodeStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Handle of the client connection that registered (or reconnected) a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registration request for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub node_type: NodeType,
    pub node_name: String,
    pub port: u32,
    pub proxy_name: Option<String>,
    pub status: NodeStatus,
    pub ip_address: Option<String>,
    pub data_folder: Option<String>,
    /// `INVALID` asks the registry to start the node at the current global xmin
    pub reported_xmin: TransactionId,
    /// `None` for nodes restored from the register log or applied on a standby
    pub socket: Option<ConnectionId>,
}

impl Registration {
    /// Minimal connected registration with no connection info
    pub fn new(node_type: NodeType, node_name: impl Into<String>) -> Self {
        Self {
            node_type,
            node_name: node_name.into(),
            port: 0,
            proxy_name: None,
            status: NodeStatus::Connected,
            ip_address: None,
            data_folder: None,
            reported_xmin: TransactionId::INVALID,
            socket: None,
        }
    }
}

/// Mutable part of a node record, guarded by the record lock
#[derive(Debug)]
pub struct NodeState {
    pub port: u32,
    pub proxy_name: Option<String>,
    pub ip_address: Option<String>,
    pub data_folder: Option<String>,
    pub socket: Option<ConnectionId>,
    pub status: NodeStatus,
    pub reported_xmin: TransactionId,
    pub reported_xmin_time: DateTime<Utc>,
    pub idle: bool,
    pub excluded: bool,
    pub sessions: SessionTable,
}

impl NodeState {
    /// Take over connection info from a re-registration of a disconnected node.
    ///
    /// Each of ip address and data folder is replaced independently, and only
    /// when the new registration actually carries a different value.
    pub(crate) fn reconnect_from(&mut self, incoming: NodeState) {
        if self.port != incoming.port {
            self.port = incoming.port;
        }
        if incoming.ip_address.is_some() && self.ip_address != incoming.ip_address {
            self.ip_address = incoming.ip_address;
        }
        if incoming.data_folder.is_some() && self.data_folder != incoming.data_folder {
            self.data_folder = incoming.data_folder;
        }
        self.status = NodeStatus::Connected;
        self.socket = incoming.socket;
    }
}

/// One registered cluster member.
///
/// `(node_type, node_name)` is the immutable key. Everything else lives
/// behind the record lock, which can only be taken while holding a lock on
/// the registry table.
#[derive(Debug)]
pub struct NodeRecord {
    node_type: NodeType,
    node_name: String,
    state: RwLock<NodeState>,
}

impl NodeRecord {
    pub fn new(registration: Registration, now: DateTime<Utc>) -> Self {
        Self {
            node_type: registration.node_type,
            node_name: registration.node_name,
            state: RwLock::new(NodeState {
                port: registration.port,
                proxy_name: registration.proxy_name,
                ip_address: registration.ip_address,
                data_folder: registration.data_folder,
                socket: registration.socket,
                status: registration.status,
                reported_xmin: registration.reported_xmin,
                reported_xmin_time: now,
                idle: false,
                excluded: false,
                sessions: SessionTable::new(),
            }),
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn matches(&self, node_type: NodeType, node_name: &str) -> bool {
        self.node_type == node_type && self.node_name == node_name
    }

    /// Read-lock the record. The guard borrows the table lock, so the table
    /// lock cannot be released first.
    pub fn read<'r, L: TableLock>(&'r self, _held: &'r L) -> RwLockReadGuard<'r, NodeState> {
        self.state.read()
    }

    /// Write-lock the record under a held table lock
    pub fn write<'r, L: TableLock>(&'r self, _held: &'r L) -> RwLockWriteGuard<'r, NodeState> {
        self.state.write()
    }

    /// Exclusive access before the record is shared
    pub(crate) fn state_mut(&mut self) -> &mut NodeState {
        self.state.get_mut()
    }

    pub(crate) fn into_state(self) -> NodeState {
        self.state.into_inner()
    }

    /// Point-in-time view of the record
    pub fn info<L: TableLock>(&self, held: &L) -> NodeInfo {
        let state = self.read(held);
        NodeInfo {
            node_type: self.node_type,
            node_name: self.node_name.clone(),
            port: state.port,
            proxy_name: state.proxy_name.clone(),
            ip_address: state.ip_address.clone(),
            data_folder: state.data_folder.clone(),
            status: state.status,
            connection: state.socket,
            reported_xmin: state.reported_xmin,
            reported_xmin_time: state.reported_xmin_time,
            idle: state.idle,
            excluded: state.excluded,
            sessions: state.sessions.len(),
        }
    }
}

/// Snapshot of a node record for administrative queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub node_name: String,
    pub port: u32,
    pub proxy_name: Option<String>,
    pub ip_address: Option<String>,
    pub data_folder: Option<String>,
    pub status: NodeStatus,
    pub connection: Option<ConnectionId>,
    pub reported_xmin: TransactionId,
    pub reported_xmin_time: DateTime<Utc>,
    pub idle: bool,
    pub excluded: bool,
    pub sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ip: Option<&str>, folder: Option<&str>, port: u32) -> NodeState {
        let mut reg = Registration::new(NodeType::Datanode, "dn1");
        reg.ip_address = ip.map(String::from);
        reg.data_folder = folder.map(String::from);
        reg.port = port;
        reg.socket = Some(ConnectionId(9));
        NodeRecord::new(reg, Utc::now()).into_state()
    }

    #[test]
    fn test_reconnect_updates_fields_independently() {
        let mut current = state(Some("10.0.0.1"), Some("/data/dn1"), 5432);
        current.status = NodeStatus::Disconnected;
        current.socket = None;

        current.reconnect_from(state(Some("10.0.0.2"), Some("/data/dn1"), 5433));
        assert_eq!(current.ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(current.data_folder.as_deref(), Some("/data/dn1"));
        assert_eq!(current.port, 5433);
        assert_eq!(current.status, NodeStatus::Connected);
        assert_eq!(current.socket, Some(ConnectionId(9)));

        current.reconnect_from(state(None, Some("/data/dn1-new"), 5433));
        assert_eq!(current.ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(current.data_folder.as_deref(), Some("/data/dn1-new"));
    }

    #[test]
    fn test_wire_values() {
        for ty in [NodeType::Coordinator, NodeType::Datanode, NodeType::Proxy] {
            assert_eq!(NodeType::from_u32(ty.as_u32()), Some(ty));
        }
        assert_eq!(NodeType::from_u32(0), None);
        assert_eq!(NodeStatus::from_u32(7), None);
        assert!(!NodeType::Proxy.reports_xmin());
    }
}
