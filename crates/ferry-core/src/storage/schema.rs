//! SQLite schema for the local store
//!
//! One table per syncable entity type, the mutation queue, and the
//! per-table cursor table. Entity tables share a single column layout:
//! domain fields are stored as a JSON document, with the natural key and
//! parent id lifted into indexed columns.

use rusqlite::{Connection, Result};

use crate::models::Table;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Mutation queue (append-only intents)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            action TEXT NOT NULL,
            payload TEXT NOT NULL,
            device_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_attempt_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue(table_name, record_id);

        -- Per-table pull cursors
        CREATE TABLE IF NOT EXISTS sync_meta (
            table_name TEXT PRIMARY KEY,
            last_pull_timestamp INTEGER NOT NULL
        );
        "#,
    )?;

    for table in Table::ALL {
        conn.execute_batch(&entity_table_sql(table))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// DDL for one entity table and its indexes
fn entity_table_sql(table: Table) -> String {
    let name = table.as_str();
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            natural_key TEXT,
            parent_id TEXT,
            updated_at INTEGER NOT NULL,
            _synced INTEGER NOT NULL DEFAULT 0,
            _device_id TEXT NOT NULL,
            _deleted INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_{name}_natural_key ON {name}(natural_key);
        CREATE INDEX IF NOT EXISTS idx_{name}_parent_id ON {name}(parent_id);
        CREATE INDEX IF NOT EXISTS idx_{name}_synced ON {name}(_synced);
        CREATE INDEX IF NOT EXISTS idx_{name}_updated_at ON {name}(updated_at);
        "#
    )
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = ? ORDER BY name")
            .unwrap()
            .query_map([kind], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = names(&conn, "table");
        assert!(tables.contains(&"sync_queue".to_string()));
        assert!(tables.contains(&"sync_meta".to_string()));
        for table in Table::ALL {
            assert!(tables.contains(&table.as_str().to_string()));
        }
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let indexes = names(&conn, "index");
        assert!(indexes.contains(&"idx_sync_queue_status".to_string()));
        assert!(indexes.contains(&"idx_patients_natural_key".to_string()));
        assert!(indexes.contains(&"idx_allergies_parent_id".to_string()));
    }
}
