//! WolfGTM - Node Registry and Global Xmin Service
//!
//! The membership and watermark half of a centralized transaction manager for
//! a distributed database cluster. It tracks every coordinator, data node and
//! proxy taking part in the cluster and computes the cluster-wide global xmin:
//! the oldest transaction any live node may still need to see, below which
//! old row versions can be reclaimed.
//!
//! # Architecture
//!
//! - `registry`: hash-bucketed membership table with two-level locking
//! - `reglog`: append-only register log, replayed on restart and compacted on
//!   shutdown
//! - `watermark`: global xmin calculation with staleness exclusion and idle
//!   node substitution
//! - `manager`: request handling tying the above together
//! - `network` / `protocol`: framed TCP transport
//! - `standby`: best-effort forwarding of state changes to a hot standby
//!
//! # Features
//!
//! - Reconnect of disconnected nodes without losing their record
//! - Monotonic global xmin under concurrent reporting
//! - Wraparound-aware transaction id comparisons
//! - Crash-tolerant register log with checksummed records

pub mod config;
pub mod error;
pub mod xid;
pub mod clock;
pub mod registry;
pub mod reglog;
pub mod watermark;
pub mod manager;
pub mod protocol;
pub mod network;
pub mod standby;

pub use config::GtmConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::GtmConfig;
    pub use crate::error::{Error, Result};
    pub use crate::manager::NodeManager;
    pub use crate::protocol::{ErrorCode, Request, Response};
    pub use crate::registry::{ConnectionId, NodeInfo, NodeStatus, NodeType, Registration, Registry};
    pub use crate::watermark::{SharedHorizon, TransactionHorizon};
    pub use crate::xid::TransactionId;
}
