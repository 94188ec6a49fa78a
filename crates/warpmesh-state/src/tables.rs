//! redb table definitions for the warpmesh state store.

use redb::TableDefinition;

/// Published key-value pairs keyed by their full path (`mesh/...`).
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Store bookkeeping (currently only the revision counter).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last committed revision.
pub const REVISION_KEY: &str = "revision";
