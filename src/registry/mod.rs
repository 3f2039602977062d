//! Node Registry
//!
//! Hash-bucketed membership table of every coordinator, data node and proxy
//! registered with the manager, plus the cluster-wide global xmin.
//!
//! Locking is two-level. The table lock guards bucket membership and the
//! global xmin; each record carries its own lock for its mutable fields.
//! Record locks are only reachable through a held table guard
//! (`TableRead` / `TableWrite`), so the table lock is always taken first.

mod node;
mod session;

pub use node::{ConnectionId, NodeInfo, NodeRecord, NodeState, NodeStatus, NodeType, Registration};
pub use session::{BackendId, ProcessId, SessionRecord, SessionTable, INITIAL_SESSION_CAPACITY};

use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::xid::TransactionId;

/// Number of hash buckets; cluster membership is small
pub const NODE_HASH_BUCKETS: usize = 16;

/// Bucket index for a node name
pub fn bucket_of(node_name: &str) -> usize {
    let bytes = node_name.as_bytes();
    if bytes.is_empty() {
        return 0;
    }

    let mut value = 0x238F_13AFu32.wrapping_mul(bytes.len() as u32);
    for (i, b) in bytes.iter().enumerate() {
        let shift = (i as u32 * 5) % 24;
        value = value.wrapping_add(((*b as u32) << shift) & 0x7fff_ffff);
    }

    let hash = (1_103_515_243u32.wrapping_mul(value).wrapping_add(12345) % 65537) & 0x0FFF;
    hash as usize % NODE_HASH_BUCKETS
}

/// Held lock on the node table. Sealed: only the registry guards qualify.
pub trait TableLock: sealed::Sealed {
    fn table(&self) -> &NodeTable;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::TableRead<'_> {}
    impl Sealed for super::TableWrite<'_> {}
}

/// Bucketed node table and the cluster watermark it guards
#[derive(Debug)]
pub struct NodeTable {
    buckets: Vec<Vec<Arc<NodeRecord>>>,
    global_xmin: TransactionId,
    global_xmin_computed_at: Option<DateTime<Utc>>,
}

impl NodeTable {
    fn new() -> Self {
        Self {
            buckets: (0..NODE_HASH_BUCKETS).map(|_| Vec::new()).collect(),
            global_xmin: TransactionId::FIRST_NORMAL,
            global_xmin_computed_at: None,
        }
    }

    /// Look up a record by its composite key
    pub fn find(&self, node_type: NodeType, node_name: &str) -> Option<&Arc<NodeRecord>> {
        self.buckets[bucket_of(node_name)]
            .iter()
            .find(|n| n.matches(node_type, node_name))
    }

    /// All records, in bucket order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeRecord>> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    pub fn nodes_by_type(&self, node_type: NodeType) -> impl Iterator<Item = &Arc<NodeRecord>> {
        self.nodes().filter(move |n| n.node_type() == node_type)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    pub fn global_xmin(&self) -> TransactionId {
        self.global_xmin
    }

    pub fn global_xmin_computed_at(&self) -> Option<DateTime<Utc>> {
        self.global_xmin_computed_at
    }
}

/// Shared lock on the node table
pub struct TableRead<'a> {
    guard: RwLockReadGuard<'a, NodeTable>,
}

impl Deref for TableRead<'_> {
    type Target = NodeTable;

    fn deref(&self) -> &NodeTable {
        &self.guard
    }
}

impl TableLock for TableRead<'_> {
    fn table(&self) -> &NodeTable {
        &self.guard
    }
}

/// Exclusive lock on the node table
pub struct TableWrite<'a> {
    guard: RwLockWriteGuard<'a, NodeTable>,
}

impl Deref for TableWrite<'_> {
    type Target = NodeTable;

    fn deref(&self) -> &NodeTable {
        &self.guard
    }
}

impl TableLock for TableWrite<'_> {
    fn table(&self) -> &NodeTable {
        &self.guard
    }
}

/// Result of a successful `add`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// An existing disconnected record was reconnected instead of inserting
    pub reconnected: bool,
    /// Xmin of the registration after defaulting an invalid value
    pub reported_xmin: TransactionId,
}

impl TableWrite<'_> {
    /// Insert a record, or reconnect an existing disconnected record with the
    /// same key. Fails with `AlreadyExists` if the existing record is
    /// connected.
    pub fn add(&mut self, mut record: NodeRecord) -> Result<AddOutcome> {
        let global_xmin = self.guard.global_xmin;
        let reported_xmin = {
            let state = record.state_mut();
            if !state.reported_xmin.is_valid() {
                state.reported_xmin = global_xmin;
            }
            state.reported_xmin
        };

        let bucket = bucket_of(record.node_name());
        let existing = self.guard.buckets[bucket]
            .iter()
            .find(|n| n.matches(record.node_type(), record.node_name()))
            .cloned();

        if let Some(existing) = existing {
            let mut current = existing.write(&*self);
            if current.status == NodeStatus::Connected {
                tracing::info!(
                    "Node {} {} already registered and connected",
                    record.node_type(),
                    record.node_name()
                );
                return Err(Error::AlreadyExists(format!(
                    "{} {}",
                    record.node_type(),
                    record.node_name()
                )));
            }

            tracing::info!(
                "Reconnecting disconnected node {} {}",
                record.node_type(),
                record.node_name()
            );
            current.reconnect_from(record.into_state());
            return Ok(AddOutcome {
                reconnected: true,
                reported_xmin,
            });
        }

        self.guard.buckets[bucket].push(Arc::new(record));
        Ok(AddOutcome {
            reconnected: false,
            reported_xmin,
        })
    }

    /// Detach a record from its bucket. Returns false if it is no longer
    /// registered.
    pub fn remove(&mut self, record: &Arc<NodeRecord>) -> bool {
        // Wait out any holder of the record lock before detaching
        drop(record.write(&*self));

        let bucket = &mut self.guard.buckets[bucket_of(record.node_name())];
        match bucket.iter().position(|n| Arc::ptr_eq(n, record)) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Ratchet the global xmin forward. Returns the stored value, which is
    /// the candidate only if it follows the current one.
    pub fn advance_global_xmin(&mut self, candidate: TransactionId, now: DateTime<Utc>) -> TransactionId {
        if self.guard.global_xmin.precedes(candidate) {
            self.guard.global_xmin = candidate;
            self.guard.global_xmin_computed_at = Some(now);
        }
        self.guard.global_xmin
    }
}

/// Concurrent node registry
#[derive(Debug)]
pub struct Registry {
    table: RwLock<NodeTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(NodeTable::new()),
        }
    }

    /// Take the table lock in shared mode
    pub fn read(&self) -> TableRead<'_> {
        TableRead {
            guard: self.table.read(),
        }
    }

    /// Take the table lock in exclusive mode
    pub fn write(&self) -> TableWrite<'_> {
        TableWrite {
            guard: self.table.write(),
        }
    }

    pub fn add(&self, record: NodeRecord) -> Result<AddOutcome> {
        self.write().add(record)
    }

    pub fn find(&self, node_type: NodeType, node_name: &str) -> Option<Arc<NodeRecord>> {
        self.read().find(node_type, node_name).cloned()
    }

    pub fn remove(&self, record: &Arc<NodeRecord>) -> bool {
        self.write().remove(record)
    }

    /// Up to `limit` records, in bucket order
    pub fn list_all(&self, limit: usize) -> Vec<Arc<NodeRecord>> {
        self.read().nodes().take(limit).cloned().collect()
    }

    /// Up to `limit` records of one type, in bucket order
    pub fn list_by_type(&self, node_type: NodeType, limit: usize) -> Vec<Arc<NodeRecord>> {
        self.read().nodes_by_type(node_type).take(limit).cloned().collect()
    }

    pub fn info(&self, node_type: NodeType, node_name: &str) -> Option<NodeInfo> {
        let table = self.read();
        table.find(node_type, node_name).map(|n| n.info(&table))
    }

    /// Snapshot of up to `limit` records, optionally filtered by type
    pub fn infos(&self, node_type: Option<NodeType>, limit: usize) -> Vec<NodeInfo> {
        let table = self.read();
        table
            .nodes()
            .filter(|n| node_type.map_or(true, |t| n.node_type() == t))
            .take(limit)
            .map(|n| n.info(&table))
            .collect()
    }

    pub fn global_xmin(&self) -> TransactionId {
        self.read().global_xmin()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
