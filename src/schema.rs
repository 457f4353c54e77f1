//! # SQLite Schema for fixrelay
//!
//! The queue lives in a single SQLite file with two tables:
//!
//! ```text
//! fixes                              fixrelay_metadata
//! ┌──────────────────────────┐       ┌────────────────┐
//! │ seq_id (PK, AUTOINCR.)   │       │ key (PK)       │
//! │ recorded_ms              │       │ value          │
//! │ payload BLOB             │       └────────────────┘
//! │ checksum BLOB            │
//! └──────────────────────────┘
//! ```
//!
//! ## Why AUTOINCREMENT?
//!
//! A plain `INTEGER PRIMARY KEY` hands out `MAX(rowid) + 1`, so once the queue
//! is fully drained the next append would reuse id 1. `AUTOINCREMENT` keeps
//! the high-water mark in `sqlite_sequence`, so ids are never reused for the
//! life of the file.
//!
//! ## Durability
//!
//! `journal_mode = WAL` with `synchronous = FULL`: every committed append is
//! fsynced before `append` returns, so a crash right after never loses it.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. No migrations: a mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// One row per queued fix.
///
/// # Columns
///
/// - `seq_id`: Sequence id, the ordering key
/// - `recorded_ms`: Fix timestamp, kept outside the payload for `stats()`
/// - `payload`: JSON-encoded [`NewFix`](crate::types::NewFix)
/// - `checksum`: XXH3-64 of `payload`, little endian
///
/// `payload` and `checksum` are nullable on purpose: a damaged row must still
/// be readable as "corrupt" rather than failing the whole scan.
const CREATE_FIXES: &str = r#"
CREATE TABLE IF NOT EXISTS fixes (
    seq_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_ms INTEGER NOT NULL,
    payload     BLOB,
    checksum    BLOB
)
"#;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS fixrelay_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the fixrelay schema applied.
///
/// Opening is synchronous and happens on the caller's thread; the connection is
/// then moved into the queue thread with [`Database::into_connection`].
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use fixrelay::Database;
    ///
    /// let db = Database::open("fixes.db")?;
    /// # Ok::<(), fixrelay::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database. Contents vanish with the connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // In-memory databases silently stay in "memory" journal mode.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = FULL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_FIXES)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM fixrelay_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO fixrelay_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this fixrelay version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Gives up the wrapper, handing the connection to its single owner.
    pub(crate) fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
