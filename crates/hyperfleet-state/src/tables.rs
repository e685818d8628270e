//! redb table definitions for the hyperfleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Group records keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Instance records keyed by `{group_id}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Idempotency ledger keyed by `{group_id}:{request_id}`.
pub const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");
