//! edgegrid-store — the strongly-consistent key/value store under the
//! edgegrid control plane.
//!
//! # Architecture
//!
//! [`RedbStore`] keeps every value in a single redb table keyed by
//! `<region>/<type-tag>/<key>`. Each commit bumps a global revision and
//! stamps the touched entries with it, which gives the store the etcd-like
//! primitives the control plane needs: compare-and-swap on mod revisions,
//! ordered watch streams, and leases that delete their keys on expiry.
//!
//! [`Stm`] and [`apply_stm`] layer optimistic transactions on top: reads
//! are tracked, writes are buffered, and the whole set commits atomically
//! or retries when a concurrent writer got there first.

pub mod error;
pub mod keys;
pub mod kv;
pub mod lease;
pub mod stm;
pub mod store;
pub mod tables;
pub mod testing;

pub use error::{StoreError, StoreResult};
pub use kv::{
    Compare, EventKind, KvEntry, KvStore, LeaseId, TxnOp, TxnRequest, WatchEvent, WatchMessage,
    WatchReceiver,
};
pub use lease::run_lease_reaper;
pub use stm::{Stm, StmConfig, apply_stm};
pub use store::RedbStore;
