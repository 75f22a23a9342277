//! redb table definitions for the edgegrid store.

use redb::TableDefinition;

/// Every stored object, keyed by `<region>/<type-tag>/<key>`. Values are
/// JSON-serialized [`crate::KvEntry`] records.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Store counters, see [`REVISION`] and [`LEASE_SEQ`].
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Live leases keyed by lease id, JSON-serialized `LeaseRecord` values.
pub const LEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("leases");

pub const REVISION: &str = "revision";
pub const LEASE_SEQ: &str = "lease_seq";
