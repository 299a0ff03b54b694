//! redb table definitions for the durable persister.
//!
//! All persisted nodes share one table keyed by their full `/`-separated
//! path, so `children` and `delete_all` are prefix scans.

use redb::TableDefinition;

/// Persisted nodes keyed by path, e.g. `Tasks/POD-A-0-A/info`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
