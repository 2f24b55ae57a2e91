//! redb table definitions for the Cutover state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Deployment group records keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Archived shifts keyed by `{group_id}:{shift_id}`.
pub const SHIFTS: TableDefinition<&str, &[u8]> = TableDefinition::new("shifts");

/// Pipeline runs keyed by `{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
