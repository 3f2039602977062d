//! Transaction Identifiers
//!
//! 32-bit transaction ids that wrap around. Ordering between two normal ids
//! is circular: `a` precedes `b` when the signed 32-bit difference `a - b`
//! is negative, so every id has 2^31 ids "before" it and 2^31 "after" it.
//!
//! Id Layout:
//! - 0: invalid
//! - 1: bootstrap
//! - 2: frozen
//! - 3..=u32::MAX: normal ids, wrapping back to 3

use serde::{Deserialize, Serialize};

/// Transaction id with wraparound-aware ordering
///
/// No `PartialOrd`/`Ord`: use `precedes` and `follows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub const INVALID: TransactionId = TransactionId(0);
    pub const BOOTSTRAP: TransactionId = TransactionId(1);
    pub const FROZEN: TransactionId = TransactionId(2);
    pub const FIRST_NORMAL: TransactionId = TransactionId(3);

    /// Create from raw value
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw u32 value
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn is_normal(&self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Is `self` logically older than `other`?
    pub fn precedes(&self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn precedes_or_equals(&self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 <= other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) <= 0
    }

    /// Is `self` logically newer than `other`?
    pub fn follows(&self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 > other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    pub fn follows_or_equals(&self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 >= other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) >= 0
    }

    pub fn equals(&self, other: TransactionId) -> bool {
        self.0 == other.0
    }

    /// The next id, skipping the special ids on wraparound
    pub fn advance(&self) -> TransactionId {
        let next = self.0.wrapping_add(1);
        if next < Self::FIRST_NORMAL.0 {
            Self::FIRST_NORMAL
        } else {
            TransactionId(next)
        }
    }

    /// The logically older of two ids
    pub fn older(self, other: TransactionId) -> TransactionId {
        if other.precedes(self) {
            other
        } else {
            self
        }
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TransactionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<TransactionId> for u32 {
    fn from(xid: TransactionId) -> Self {
        xid.0
    }
}
