//! The key/value contract the control plane relies on.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};

pub type LeaseId = u64;

/// A stored value with its revision bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: String,
    /// Number of writes since the key was created, starting at 1.
    pub version: i64,
    pub create_rev: u64,
    pub mod_rev: u64,
    #[serde(default)]
    pub lease: Option<LeaseId>,
}

/// Precondition of a transaction, evaluated against the current entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key's mod revision equals `rev`; 0 means the key is absent.
    ModRev { key: String, rev: u64 },
    /// The key is absent or was last modified at or before `rev`.
    ModRevAtMost { key: String, rev: u64 },
    /// The key's version equals `version`; 0 means the key is absent.
    Version { key: String, version: i64 },
}

impl Compare {
    pub fn key(&self) -> &str {
        match self {
            Compare::ModRev { key, .. }
            | Compare::ModRevAtMost { key, .. }
            | Compare::Version { key, .. } => key,
        }
    }

    pub fn holds(&self, current: Option<&KvEntry>) -> bool {
        let mod_rev = current.map_or(0, |e| e.mod_rev);
        match self {
            Compare::ModRev { rev, .. } => mod_rev == *rev,
            Compare::ModRevAtMost { rev, .. } => mod_rev <= *rev,
            Compare::Version { version, .. } => current.map_or(0, |e| e.version) == *version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

/// An atomic multi-key transaction: all compares must hold, then all ops
/// apply under a single new revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// The new entry for puts.
    pub entry: Option<KvEntry>,
    pub mod_rev: u64,
}

impl WatchEvent {
    pub fn put(key: String, entry: KvEntry) -> Self {
        Self {
            kind: EventKind::Put,
            mod_rev: entry.mod_rev,
            key,
            entry: Some(entry),
        }
    }

    pub fn delete(key: String, rev: u64) -> Self {
        Self {
            kind: EventKind::Delete,
            key,
            entry: None,
            mod_rev: rev,
        }
    }
}

/// Messages delivered to a watcher, in revision order.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchMessage {
    /// Everything under the prefix as of `rev`. Always the first message.
    Snapshot {
        rev: u64,
        entries: Vec<(String, KvEntry)>,
    },
    /// The changes of one commit. Sent for every commit, even when none
    /// of its keys fall under the prefix, so watchers can track revisions.
    Batch { rev: u64, events: Vec<WatchEvent> },
}

impl WatchMessage {
    pub fn rev(&self) -> u64 {
        match self {
            WatchMessage::Snapshot { rev, .. } | WatchMessage::Batch { rev, .. } => *rev,
        }
    }
}

pub type WatchReceiver = mpsc::UnboundedReceiver<WatchMessage>;

/// Linearizable, watchable, leased key/value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<KvEntry>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &str) -> StoreResult<Vec<(String, KvEntry)>>;

    fn revision(&self) -> StoreResult<u64>;

    /// Apply a transaction, returning the revision it committed at.
    /// A failed compare yields [`StoreError::Conflict`]. A transaction
    /// without ops only checks its compares and returns the current
    /// revision.
    fn commit(&self, txn: TxnRequest) -> StoreResult<u64>;

    fn watch(&self, prefix: &str) -> StoreResult<WatchReceiver>;

    fn grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Drop the lease and every key bound to it.
    fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke every lease whose deadline has passed. Returns how many
    /// leases expired.
    fn expire_leases(&self) -> StoreResult<usize>;

    fn create(&self, key: &str, value: &str) -> StoreResult<u64> {
        let txn = TxnRequest {
            compares: vec![Compare::ModRev {
                key: key.to_string(),
                rev: 0,
            }],
            ops: vec![put_op(key, value, None)],
        };
        match self.commit(txn) {
            Err(StoreError::Conflict) => Err(StoreError::KeyExists(key.to_string())),
            other => other,
        }
    }

    /// Compare-and-swap on the key's version.
    fn update(&self, key: &str, value: &str, version: i64) -> StoreResult<u64> {
        let txn = TxnRequest {
            compares: vec![Compare::Version {
                key: key.to_string(),
                version,
            }],
            ops: vec![put_op(key, value, None)],
        };
        match self.commit(txn) {
            Err(StoreError::Conflict) => match self.get(key)? {
                None => Err(StoreError::KeyNotFound(key.to_string())),
                Some(_) => Err(StoreError::VersionMismatch(key.to_string())),
            },
            other => other,
        }
    }

    fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<u64> {
        self.commit(TxnRequest {
            compares: Vec::new(),
            ops: vec![put_op(key, value, lease)],
        })
    }

    fn delete(&self, key: &str) -> StoreResult<u64> {
        self.commit(TxnRequest {
            compares: Vec::new(),
            ops: vec![TxnOp::Delete {
                key: key.to_string(),
            }],
        })
    }
}

fn put_op(key: &str, value: &str, lease: Option<LeaseId>) -> TxnOp {
    TxnOp::Put {
        key: key.to_string(),
        value: value.to_string(),
        lease,
    }
}
