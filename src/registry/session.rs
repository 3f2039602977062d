//! Coordinator Session Table
//!
//! Active backend sessions of one coordinator, keyed by process id and
//! backend id. Entries are never removed; a backend slot that is reused by a
//! new process overwrites the old process id.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Operating-system process id of a coordinator backend
pub type ProcessId = u32;

/// Backend slot number on a coordinator
pub type BackendId = u32;

/// Capacity reserved on the first session registration
pub const INITIAL_SESSION_CAPACITY: usize = 256;

/// One active backend process on a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub coord_proc_id: ProcessId,
    pub coord_backend_id: BackendId,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Vec<SessionRecord>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend session.
    ///
    /// Returns the process id that previously held `backend_id` when the slot
    /// is being reused by a different process, so the caller can terminate
    /// the stale backend. A known `proc_id` is a reconnect and returns `None`.
    pub fn register(&mut self, proc_id: ProcessId, backend_id: BackendId) -> Result<Option<ProcessId>> {
        for session in self.sessions.iter_mut() {
            if session.coord_proc_id == proc_id {
                return Ok(None);
            }
            if session.coord_backend_id == backend_id {
                let previous = session.coord_proc_id;
                session.coord_proc_id = proc_id;
                return Ok(Some(previous));
            }
        }

        if self.sessions.capacity() == 0 {
            self.sessions
                .try_reserve_exact(INITIAL_SESSION_CAPACITY)
                .map_err(|e| Error::OutOfMemory(format!("session table: {}", e)))?;
        } else {
            self.sessions
                .try_reserve(1)
                .map_err(|e| Error::OutOfMemory(format!("session table: {}", e)))?;
        }

        self.sessions.push(SessionRecord {
            coord_proc_id: proc_id,
            coord_backend_id: backend_id,
        });
        Ok(None)
    }

    pub fn find_by_backend(&self, backend_id: BackendId) -> Option<&SessionRecord> {
        self.sessions.iter().find(|s| s.coord_backend_id == backend_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
