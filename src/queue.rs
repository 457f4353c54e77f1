//! # Durable Queue
//!
//! The queue is an ordered, bounded, crash-safe list of [`FixRecord`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  mpsc   ┌──────────────────────────────┐
//! │ DurableQueue   │────────►│ queue thread                 │
//! │ (Clone, async) │         │   QueueStore { conn, len }   │
//! │  ingestor      │◄────────│   one request at a time      │
//! │  dispatcher    │ oneshot └──────────────────────────────┘
//! └────────────────┘
//! ```
//!
//! A single thread owns the SQLite connection. Every operation is one request
//! on the channel and runs to completion before the next one starts, so each
//! call is atomic with respect to every other caller. No lock spans a dispatch
//! cycle: the dispatcher peeks, uploads, then deletes by explicit id, and
//! appends may land in between.
//!
//! ## Invariants
//!
//! - Sequence ids strictly increase and are never reused (AUTOINCREMENT)
//! - `len <= capacity` after every successful append
//! - `peek_batch` returns records in ascending sequence order
//! - A record is durable (fsynced) before `append` returns

use log::{debug, warn};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{decode_fix, encode_fix};
use crate::error::{classify_append_failure, Error, Result};
use crate::schema::Database;
use crate::types::{FixRecord, NewFix, SequenceId};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 256;

// =============================================================================
// Result Types
// =============================================================================

/// One `peek_batch` result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Intact records, ascending by sequence id.
    pub records: Vec<FixRecord>,

    /// Highest row id scanned, including corrupt rows that were skipped.
    /// `delete_up_to(through)` removes exactly what this batch covered.
    pub through: Option<SequenceId>,
}

impl Batch {
    /// True when the scan found no rows at all.
    pub fn is_exhausted(&self) -> bool {
        self.through.is_none()
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    /// Timestamp of the oldest pending fix.
    pub oldest_timestamp_ms: Option<u64>,
}

// =============================================================================
// Queue Store (synchronous, owns the connection)
// =============================================================================

/// The synchronous queue. Lives on the queue thread.
///
/// `len` mirrors `COUNT(*)` and is only updated after a statement commits, so
/// memory never leads disk.
pub struct QueueStore {
    conn: Connection,
    capacity: usize,
    len: usize,
}

impl QueueStore {
    /// Wraps an initialized database, counting what survived the last run.
    pub fn new(db: Database, capacity: usize) -> Result<Self> {
        let conn = db.into_connection();
        let len: i64 = conn.query_row("SELECT COUNT(*) FROM fixes", [], |row| row.get(0))?;
        Ok(Self {
            conn,
            capacity,
            len: len as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the ceiling. Shrinking never evicts; appends fail until
    /// dispatch drains below the new value.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Persists one fix and returns its sequence id.
    ///
    /// # Errors
    ///
    /// - `Error::QueueFull` at capacity, or when the disk is full
    /// - `Error::StorageUnavailable` for any other storage failure
    pub fn append(&mut self, fix: &NewFix) -> Result<SequenceId> {
        if self.len >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }

        let (payload, checksum) = encode_fix(fix);

        // Autocommit: one implicit transaction, synced before execute returns.
        self.conn
            .execute(
                "INSERT INTO fixes (recorded_ms, payload, checksum) VALUES (?1, ?2, ?3)",
                params![recorded_ms(fix.timestamp_ms), payload, checksum],
            )
            .map_err(|e| classify_append_failure(e, self.capacity))?;

        self.len += 1;
        let rowid = self.conn.last_insert_rowid();
        SequenceId::from_row(rowid)
            .ok_or_else(|| Error::Schema(format!("fixes returned row id {rowid}")))
    }

    /// Returns up to `max` of the oldest intact records without removing them.
    ///
    /// Corrupt rows are logged and skipped, and the scan keeps going until
    /// `max` intact records are found or the table ends. They are still
    /// covered by `through`, so the next acknowledged delete purges them.
    pub fn peek_batch(&self, max: usize) -> Result<Batch> {
        let mut batch = Batch::default();
        if max == 0 {
            return Ok(batch);
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT seq_id, payload, checksum FROM fixes WHERE seq_id > ?1 ORDER BY seq_id LIMIT ?2",
        )?;

        let mut cursor: i64 = 0;
        loop {
            let wanted = i64::try_from(max - batch.records.len()).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![cursor, wanted], |row| {
                    Ok((row.get::<_, i64>(0)?, column_bytes(row, 1)?, column_bytes(row, 2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if rows.is_empty() {
                break;
            }

            for (seq_id, payload, checksum) in rows {
                cursor = seq_id;
                let Some(sequence_id) = SequenceId::from_row(seq_id) else {
                    warn!("skipping fix with invalid row id {seq_id}");
                    continue;
                };
                batch.through = Some(sequence_id);

                match decode_fix(payload.as_deref(), checksum.as_deref()) {
                    Ok(fix) => batch.records.push(FixRecord::new(sequence_id, fix)),
                    Err(reason) => warn!("skipping corrupt fix {sequence_id}: {reason}"),
                }
            }

            if batch.records.len() >= max {
                break;
            }
        }

        Ok(batch)
    }

    /// Removes every record with id `<= through`. Returns how many were removed.
    pub fn delete_up_to(&mut self, through: SequenceId) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM fixes WHERE seq_id <= ?1",
                params![through.as_row().unwrap_or(i64::MAX)],
            )?;
        self.len = self.len.saturating_sub(removed);
        Ok(removed)
    }

    /// Removes the given ids in one transaction. Missing ids are ignored.
    pub fn delete_set(&mut self, ids: &[SequenceId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM fixes WHERE seq_id = ?1")?;
            for row in ids.iter().filter_map(SequenceId::as_row) {
                removed += stmt.execute(params![row])?;
            }
        }
        tx.commit()?;

        self.len = self.len.saturating_sub(removed);
        Ok(removed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let oldest: Option<i64> = self
            .conn
            .query_row(
                "SELECT recorded_ms FROM fixes ORDER BY seq_id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        Ok(QueueStats {
            len: self.len,
            capacity: self.capacity,
            oldest_timestamp_ms: oldest.and_then(|ms| u64::try_from(ms).ok()),
        })
    }
}

/// Timestamps beyond SQLite's integer range are clamped for `recorded_ms`;
/// the payload keeps the exact value.
fn recorded_ms(timestamp_ms: u64) -> i64 {
    i64::try_from(timestamp_ms).unwrap_or(i64::MAX)
}

/// Reads a column as bytes. Anything other than TEXT/BLOB reads as missing.
fn column_bytes(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<u8>>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Some(bytes.to_vec()),
        _ => None,
    })
}

// =============================================================================
// Requests
// =============================================================================

enum QueueRequest {
    Append {
        fix: NewFix,
        response: oneshot::Sender<Result<SequenceId>>,
    },
    Peek {
        max: usize,
        response: oneshot::Sender<Result<Batch>>,
    },
    DeleteUpTo {
        through: SequenceId,
        response: oneshot::Sender<Result<usize>>,
    },
    DeleteSet {
        ids: Vec<SequenceId>,
        response: oneshot::Sender<Result<usize>>,
    },
    Stats {
        response: oneshot::Sender<Result<QueueStats>>,
    },
    SetCapacity {
        capacity: usize,
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        response: oneshot::Sender<Result<()>>,
    },
}

fn run_queue(mut store: QueueStore, mut rx: mpsc::Receiver<QueueRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            QueueRequest::Append { fix, response } => {
                let _ = response.send(store.append(&fix));
            }
            QueueRequest::Peek { max, response } => {
                let _ = response.send(store.peek_batch(max));
            }
            QueueRequest::DeleteUpTo { through, response } => {
                let _ = response.send(store.delete_up_to(through));
            }
            QueueRequest::DeleteSet { ids, response } => {
                let _ = response.send(store.delete_set(&ids));
            }
            QueueRequest::Stats { response } => {
                let _ = response.send(store.stats());
            }
            QueueRequest::SetCapacity { capacity, response } => {
                store.set_capacity(capacity);
                let _ = response.send(Ok(()));
            }
            QueueRequest::Shutdown { response } => {
                drop(store);
                debug!("queue thread shut down");
                let _ = response.send(Ok(()));
                return;
            }
        }
    }
    debug!("queue handles dropped, closing store");
}

// =============================================================================
// Durable Queue Handle (Async Interface)
// =============================================================================

/// Async handle to the queue thread.
///
/// Cheap to clone; every clone talks to the same store. The thread exits when
/// [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Clone, Debug)]
pub struct DurableQueue {
    tx: mpsc::Sender<QueueRequest>,
}

impl DurableQueue {
    /// Starts the queue thread over an opened database.
    pub fn spawn(db: Database, capacity: usize) -> Result<Self> {
        let store = QueueStore::new(db, capacity)?;
        debug!(
            "queue opened with {} pending fixes (capacity {})",
            store.len(),
            store.capacity()
        );

        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        std::thread::Builder::new()
            .name("fixrelay-queue".to_string())
            .spawn(move || run_queue(store, rx))
            .map_err(|e| Error::StorageUnavailable(format!("failed to spawn queue thread: {e}")))?;

        Ok(Self { tx })
    }

    /// Opens (or creates) a queue file and starts its thread.
    pub fn open(path: impl AsRef<std::path::Path>, capacity: usize) -> Result<Self> {
        Self::spawn(Database::open(path)?, capacity)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> QueueRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::StorageUnavailable("queue has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::StorageUnavailable("queue dropped response".to_string()))?
    }

    /// Persists a fix; see [`QueueStore::append`].
    pub async fn append(&self, fix: NewFix) -> Result<SequenceId> {
        self.call(|response| QueueRequest::Append { fix, response })
            .await
    }

    /// See [`QueueStore::peek_batch`].
    pub async fn peek_batch(&self, max: usize) -> Result<Batch> {
        self.call(|response| QueueRequest::Peek { max, response })
            .await
    }

    pub async fn delete_up_to(&self, through: SequenceId) -> Result<usize> {
        self.call(|response| QueueRequest::DeleteUpTo { through, response })
            .await
    }

    pub async fn delete_set(&self, ids: Vec<SequenceId>) -> Result<usize> {
        self.call(|response| QueueRequest::DeleteSet { ids, response })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.call(|response| QueueRequest::Stats { response }).await
    }

    pub async fn size(&self) -> Result<usize> {
        Ok(self.stats().await?.len)
    }

    pub async fn capacity(&self) -> Result<usize> {
        Ok(self.stats().await?.capacity)
    }

    pub async fn set_capacity(&self, capacity: usize) -> Result<()> {
        self.call(|response| QueueRequest::SetCapacity { capacity, response })
            .await
    }

    /// Stops the queue thread and closes the connection.
    ///
    /// Every later call on any clone returns `StorageUnavailable`.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|response| QueueRequest::Shutdown { response })
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
