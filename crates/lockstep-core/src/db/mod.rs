//! Embedded SQLite state store.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so context reads never block on a pending write
//! - `busy_timeout` from config to absorb transient lock waits
//! - `foreign_keys = ON` so stories always reference an existing epic
//!
//! The store file lives inside the version-controlled tree. Before every git
//! commit the WAL is checkpointed with `TRUNCATE`, so the committed file
//! always holds every committed row; the `-wal`/`-shm` sidecars are ignored
//! by git.

pub mod migrations;
pub mod schema;

use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StateError};

/// Suffixes of the SQLite sidecar files that must never be committed.
pub const SIDECAR_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Schema and migration bookkeeping kept in `store_meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMeta {
    pub schema_version: u32,
    /// Last completed migration phase (0 when the tree was never migrated).
    pub migration_phase: u32,
    pub migration_revision: Option<String>,
}

/// Owning handle to the writer connection of the state store.
#[derive(Debug)]
pub struct StateStore {
    conn: Connection,
    path: PathBuf,
    busy_timeout: Duration,
}

impl StateStore {
    /// Open (or create) the store at `path`, apply pragmas, and migrate the
    /// schema to the latest version.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring, or migrating fails.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StateError::io(parent, err))?;
        }

        let mut conn = Connection::open(path)?;
        configure_connection(&conn, busy_timeout)?;
        migrations::migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            busy_timeout,
        })
    }

    /// In-memory store for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if migrating the fresh database fails.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
            busy_timeout: Duration::ZERO,
        })
    }

    /// Close the current connection and open the file again.
    ///
    /// Used after the file was replaced underneath the connection (hard reset,
    /// branch checkout).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reopened.
    pub fn reopen(self) -> Result<Self> {
        let Self {
            conn,
            path,
            busy_timeout,
        } = self;
        close(conn)?;
        Self::open(&path, busy_timeout)
    }

    /// Close the connection, checkpointing the WAL into the main file.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses to close the connection.
    pub fn close(self) -> Result<()> {
        close(self.conn)
    }

    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    /// Begin a write transaction, taking the write lock immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if another writer holds the lock past the busy timeout.
    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commit the open write transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open write transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite rejects the rollback.
    pub fn rollback(&self) -> Result<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Flush the WAL into the main database file and truncate it.
    ///
    /// # Errors
    ///
    /// Returns an error if a reader prevents a complete checkpoint; committing
    /// the file in that state would lose rows.
    pub fn checkpoint(&self) -> Result<()> {
        let (busy, log_frames, checkpointed): (i64, i64, i64) = self.conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if busy != 0 || (log_frames >= 0 && checkpointed < log_frames) {
            return Err(StateError::Internal(format!(
                "incomplete WAL checkpoint (busy={busy}, log={log_frames}, checkpointed={checkpointed})"
            )));
        }
        Ok(())
    }

    /// Read schema and migration bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the `store_meta` row is missing or unreadable.
    pub fn meta(&self) -> Result<StoreMeta> {
        read_meta(&self.conn)
    }

    /// Record the last completed migration phase and the revision it ran at.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn set_migration_phase(&self, phase: u32, revision: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE store_meta
             SET migration_phase = ?1, migration_revision = ?2, updated_at_us = ?3
             WHERE id = 1",
            rusqlite::params![i64::from(phase), revision, crate::service::now_us()],
        )?;
        Ok(())
    }
}

fn close(conn: Connection) -> Result<()> {
    conn.close().map_err(|(_, err)| StateError::Store(err))
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

/// Open a query-only connection for lock-free snapshot reads.
///
/// # Errors
///
/// Returns [`StateError::NotInitialized`] when the store file does not exist,
/// or a store error if it cannot be opened.
pub fn open_reader(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if !path.exists() {
        return Err(StateError::NotInitialized(path.to_path_buf()));
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(conn)
}

/// Paths of the sidecar files SQLite may create next to `store_path`.
#[must_use]
pub fn sidecar_paths(store_path: &Path) -> Vec<PathBuf> {
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name = store_path.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

fn read_meta(conn: &Connection) -> Result<StoreMeta> {
    let row = conn
        .query_row(
            "SELECT schema_version, migration_phase, migration_revision
             FROM store_meta WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let (schema_version, migration_phase, migration_revision) =
        row.ok_or_else(|| StateError::Internal("store_meta row is missing".to_string()))?;

    let to_u32 = |value: i64| {
        u32::try_from(value)
            .map_err(|_| StateError::Internal(format!("store_meta value out of range: {value}")))
    };

    Ok(StoreMeta {
        schema_version: to_u32(schema_version)?,
        migration_phase: to_u32(migration_phase)?,
        migration_revision,
    })
}
