//! edgegrid-sync — keeps in-memory object caches in step with the store.
//!
//! Every resource type has an [`ObjectCache`]. The [`SyncEngine`] owns the
//! ordered list of caches, watches the region prefix of the store, and
//! applies each committed revision to the caches in registration order.
//! [`SyncEngine::apply_stm_wait`] runs a transaction and returns only once
//! the caches reflect it, so callers always read their own writes.

pub mod cache;
pub mod error;
pub mod filter;
pub mod progress;
pub mod sync;
pub mod wait;

pub use cache::{CacheEvent, KeyWatch, ObjectCache, SyncCache};
pub use error::{SyncError, SyncResult};
pub use progress::{CollectProgress, LogProgress, Progress};
pub use sync::{KeepAlive, SyncEngine};
pub use wait::WaitSpec;
