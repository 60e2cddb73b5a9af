//! Photos table DDL and migrations for the local backend.

use rusqlite::Connection;

use super::error::BackendError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// `created_at` is stored as microseconds since the Unix epoch so rows
/// created within the same second still sort correctly.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS photos (
    id TEXT PRIMARY KEY NOT NULL,
    file_path TEXT NOT NULL UNIQUE,
    file_url TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    device_type TEXT NOT NULL DEFAULT 'desktop'
);

CREATE INDEX IF NOT EXISTS idx_photos_created_at ON photos(created_at);
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, BackendError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Initialize or migrate the database schema. Idempotent.
pub(crate) fn migrate(conn: &Connection) -> Result<(), BackendError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(BackendError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrated photos schema"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(BackendError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_photos_table_and_index_created() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name = 'idx_photos_created_at'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn test_file_path_unique() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let insert = "INSERT INTO photos (id, file_path, file_url, created_at) VALUES (?1, 'photos/a.jpg', 'u', 0)";
        conn.execute(insert, ["one"]).unwrap();
        assert!(conn.execute(insert, ["two"]).is_err());
    }
}
