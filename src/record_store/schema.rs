//! SQLite schema for the record database.

use crate::sqlite_column;
use crate::sqlite_persistence::{CascadeRef, Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Records and record meta
// =============================================================================

const RECORDS_TABLE_V1: Table = Table {
    name: "records",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("title", &SqlType::Text, non_null = true),
        sqlite_column!("category", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("created_at_utc", &SqlType::Text, non_null = true),
        sqlite_column!("modified_at", &SqlType::Text, non_null = true),
        sqlite_column!("modified_at_utc", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_records_category_status", "category, status")],
    unique_constraints: &[],
};

const RECORD_REF: CascadeRef = CascadeRef {
    table: "records",
    column: "id",
};

/// Per-record key/value metadata. Rows go away with their record.
const RECORD_META_TABLE_V1: Table = Table {
    name: "record_meta",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "record_id",
            &SqlType::Integer,
            non_null = true,
            references = Some(&RECORD_REF)
        ),
        sqlite_column!("meta_key", &SqlType::Text, non_null = true),
        sqlite_column!("meta_value", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_record_meta_key", "meta_key")],
    unique_constraints: &[&["record_id", "meta_key"]],
};

pub const RECORDS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[RECORDS_TABLE_V1, RECORD_META_TABLE_V1],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_v1_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = RECORDS_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }
}
