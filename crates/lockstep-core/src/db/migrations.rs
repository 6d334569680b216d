//! Versioned schema migrations, tracked in `PRAGMA user_version` and mirrored
//! into `store_meta.schema_version`.

use rusqlite::{Connection, types::Type};
use tracing::info;

use super::schema;
use crate::error::{Result, StateError};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "entity tables and store meta",
        sql: schema::MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "context and consistency indexes",
        sql: schema::MIGRATION_V2_SQL,
    },
];

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// # Errors
///
/// Returns an error if the pragma cannot be read or does not fit a `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(err)))
}

/// Bring the schema up to [`LATEST_SCHEMA_VERSION`], one transaction per
/// pending step. Returns the resulting version.
///
/// # Errors
///
/// [`StateError::Internal`] for a store written by a newer schema;
/// [`StateError::Store`] when a step fails (that step is rolled back).
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    let start = current_schema_version(conn)?;
    if start > LATEST_SCHEMA_VERSION {
        return Err(StateError::Internal(format!(
            "state store schema v{start} is newer than supported v{LATEST_SCHEMA_VERSION}"
        )));
    }

    let mut version = start;
    for step in MIGRATIONS.iter().filter(|m| m.version > start) {
        let tx = conn.transaction()?;
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", i64::from(step.version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(step.version)],
        )?;
        tx.commit()?;
        info!(version = step.version, name = step.name, "state store schema upgraded");
        version = step.version;
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::{LATEST_SCHEMA_VERSION, MIGRATIONS, current_schema_version, migrate};
    use crate::db::schema;
    use crate::error::StateError;
    use rusqlite::Connection;

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
            .expect("prepare");
        stmt.query_map([kind], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows")
    }

    #[test]
    fn steps_are_contiguous_and_end_at_latest() {
        for (idx, step) in MIGRATIONS.iter().enumerate() {
            assert_eq!(step.version as usize, idx + 1, "{}", step.name);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(LATEST_SCHEMA_VERSION));
    }

    #[test]
    fn fresh_database_gets_every_table_and_index() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert_eq!(migrate(&mut conn).expect("migrate"), LATEST_SCHEMA_VERSION);

        let tables = names(&conn, "table");
        for table in schema::ENTITY_TABLES.iter().chain(&["store_meta"]) {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
        let indexes = names(&conn, "index");
        for index in schema::REQUIRED_INDEXES {
            assert!(indexes.iter().any(|i| i == index), "missing index {index}");
        }
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("first");
        assert_eq!(migrate(&mut conn).expect("second"), LATEST_SCHEMA_VERSION);

        let (rows, version): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(schema_version) FROM store_meta",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("meta");
        assert_eq!(rows, 1);
        assert_eq!(version, i64::from(LATEST_SCHEMA_VERSION));
    }

    #[test]
    fn upgrade_from_v1_keeps_existing_rows() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(schema::MIGRATION_V1_SQL).expect("v1");
        conn.pragma_update(None, "user_version", 1_i64).expect("pragma");
        conn.execute(
            "INSERT INTO epics (epic_num, title, created_at_us, updated_at_us)
             VALUES (7, 'Billing', 1, 1)",
            [],
        )
        .expect("insert");

        migrate(&mut conn).expect("upgrade");
        assert_eq!(current_schema_version(&conn).expect("version"), 2);
        let title: String = conn
            .query_row("SELECT title FROM epics WHERE epic_num = 7", [], |row| row.get(0))
            .expect("row");
        assert_eq!(title, "Billing");
    }

    #[test]
    fn newer_store_is_refused() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.pragma_update(None, "user_version", 99_i64).expect("pragma");
        assert!(matches!(migrate(&mut conn), Err(StateError::Internal(_))));
    }

    #[test]
    fn aggregate_check_rejects_overcount() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        let result = conn.execute(
            "INSERT INTO epics (epic_num, title, total_stories, completed_stories,
                                in_progress_stories, created_at_us, updated_at_us)
             VALUES (1, 'Broken', 1, 1, 1, 0, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
