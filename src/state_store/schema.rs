//! SQLite schema for the refresher state database.
//!
//! Holds settings and other small values (key/value), the single-flight run
//! locks, the audit log and the run history.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - State, run locks, audit log
// =============================================================================

const STATE_TABLE_V1: Table = Table {
    name: "refresher_state",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!(
            "updated_at",
            &SqlType::Text,
            non_null = true,
            default_value = Some("(datetime('now'))")
        ),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// Time-boxed exclusive markers. A row whose `expires_at` (unix seconds) has
/// passed no longer counts as held.
const RUN_LOCKS_TABLE_V1: Table = Table {
    name: "run_locks",
    columns: &[
        sqlite_column!("name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// Audit log, chronological by id.
const AUDIT_LOG_TABLE_V1: Table = Table {
    name: "audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("record_id", &SqlType::Integer, non_null = true),
        sqlite_column!("record_title", &SqlType::Text, non_null = true),
        sqlite_column!("old_timestamp", &SqlType::Text, non_null = true),
        sqlite_column!("new_timestamp", &SqlType::Text, non_null = true),
        sqlite_column!("applied_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_audit_log_record_id", "record_id")],
    unique_constraints: &[],
};

// =============================================================================
// Version 2 - Run history
// =============================================================================

const REFRESH_RUNS_TABLE_V2: Table = Table {
    name: "refresh_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
        sqlite_column!(
            "records_updated",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "records_failed",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("message", &SqlType::Text),
    ],
    indices: &[("idx_refresh_runs_status", "status")],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    REFRESH_RUNS_TABLE_V2.create(conn)
}

pub const STATE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[STATE_TABLE_V1, RUN_LOCKS_TABLE_V1, AUDIT_LOG_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            STATE_TABLE_V1,
            RUN_LOCKS_TABLE_V1,
            AUDIT_LOG_TABLE_V1,
            REFRESH_RUNS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_all_versions_create_and_validate() {
        for schema in STATE_VERSIONED_SCHEMAS {
            let conn = Connection::open_in_memory().unwrap();
            schema.create(&conn).unwrap();
            schema.validate(&conn).unwrap();
        }
    }

    #[test]
    fn test_v1_to_v2_migration_matches_v2_schema() {
        let conn = Connection::open_in_memory().unwrap();
        STATE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        migrate_v1_to_v2(&conn).unwrap();
        STATE_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }
}
