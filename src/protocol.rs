//! Manager Wire Protocol
//!
//! Request/response messages exchanged with coordinators, data nodes,
//! proxies and the standby manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::registry::{NodeInfo, NodeType, ProcessId, BackendId, Registration};
use crate::xid::TransactionId;

/// Requests handled by the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // ========== Registration ==========
    /// Register (or reconnect) a node
    RegisterNode {
        registration: Registration,
        /// Replayed from the primary manager; honoured only by a manager
        /// configured to accept forwarded registrations
        forwarded: bool,
    },

    /// Remove a node
    UnregisterNode {
        node_type: NodeType,
        node_name: String,
    },

    /// A node's backend went away
    BackendDisconnect {
        is_postmaster: bool,
        node_type: NodeType,
        node_name: String,
    },

    /// Attach a backend session to a coordinator
    RegisterCoordinatorProcess {
        node_name: String,
        proc_id: ProcessId,
        backend_id: BackendId,
    },

    // ========== Global Xmin ==========
    /// Periodic xmin report
    ReportXmin {
        node_type: NodeType,
        node_name: String,
        reported_xmin: TransactionId,
        idle: bool,
    },

    /// Current global xmin
    GlobalXmin,

    // ========== Status ==========
    /// Enumerate registered nodes
    ListNodes { node_type: Option<NodeType> },
}

/// Manager responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Node registered; the xmin it starts from
    Registered { xmin: TransactionId },

    Unregistered,

    Disconnected,

    /// Process id previously holding the backend slot, if any
    CoordinatorProcessRegistered { conflicting_pid: Option<ProcessId> },

    XminReported {
        global_xmin: TransactionId,
        /// The node's own xmin, or the substitute assigned to an idle node
        reported_xmin: TransactionId,
    },

    GlobalXmin {
        global_xmin: TransactionId,
        computed_at: Option<DateTime<Utc>>,
    },

    Nodes { nodes: Vec<NodeInfo> },

    // ========== Error ==========
    Error { code: ErrorCode, message: String },
}

/// Error codes reported to remote nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Node is registered and connected
    AlreadyExists,
    /// Unregister or disconnect of a node that was never registered
    UnknownNode,
    /// Disconnect from a connection that does not own the node
    ConnectionMismatch,
    /// Registration that cannot be persisted, such as an empty node name
    InvalidRegistration,
    /// Allocation failure
    OutOfMemory,
    /// Xmin report from an unregistered node
    NodeNotRegistered,
    /// Xmin report from a node excluded for staleness
    NodeExcluded,
    /// Reported xmin went backwards
    TooOldXmin,
    /// Manager is shutting down
    ShuttingDown,
    /// Internal error
    Internal,
}

impl Request {
    /// Serialize request to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize request from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::RegisterNode { .. } => "RegisterNode",
            Request::UnregisterNode { .. } => "UnregisterNode",
            Request::BackendDisconnect { .. } => "BackendDisconnect",
            Request::RegisterCoordinatorProcess { .. } => "RegisterCoordinatorProcess",
            Request::ReportXmin { .. } => "ReportXmin",
            Request::GlobalXmin => "GlobalXmin",
            Request::ListNodes { .. } => "ListNodes",
        }
    }
}

impl Response {
    /// Serialize response to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize response from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Response::Registered { .. } => "Registered",
            Response::Unregistered => "Unregistered",
            Response::Disconnected => "Disconnected",
            Response::CoordinatorProcessRegistered { .. } => "CoordinatorProcessRegistered",
            Response::XminReported { .. } => "XminReported",
            Response::GlobalXmin { .. } => "GlobalXmin",
            Response::Nodes { .. } => "Nodes",
            Response::Error { .. } => "Error",
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Framed wire message
pub trait WireMessage: Sized {
    fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error>;
    fn name(&self) -> &'static str;
}

impl WireMessage for Request {
    fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        self.serialize()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        Self::deserialize(bytes)
    }

    fn name(&self) -> &'static str {
        self.type_name()
    }
}

impl WireMessage for Response {
    fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        self.serialize()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        Self::deserialize(bytes)
    }

    fn name(&self) -> &'static str {
        self.type_name()
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted message body
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let mut registration = Registration::new(NodeType::Datanode, "dn1");
        registration.port = 15432;
        let req = Request::RegisterNode {
            registration,
            forwarded: false,
        };

        let bytes = req.serialize().unwrap();
        match Request::deserialize(&bytes).unwrap() {
            Request::RegisterNode {
                registration,
                forwarded,
            } => {
                assert_eq!(registration.node_name, "dn1");
                assert_eq!(registration.port, 15432);
                assert!(!forwarded);
            }
            other => panic!("Wrong request type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_error_response_carries_code() {
        let err = Error::XminTooOld {
            node: "DATANODE dn1".into(),
            reported: 5,
            previous: 9,
        };
        let bytes = Response::from_error(&err).serialize().unwrap();
        match Response::deserialize(&bytes).unwrap() {
            Response::Error { code, message } => {
                assert_eq!(code, ErrorCode::TooOldXmin);
                assert!(message.contains("dn1"));
            }
            other => panic!("Wrong response type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
