//! # Error Handling for fixrelay
//!
//! This module defines the error types used throughout the engine. Like most of
//! the crate, it follows a "single enum" approach: [`Error`] covers every failure
//! that can cross a public API boundary, and [`UploadError`] covers the narrower
//! set of per-endpoint upload failures that the dispatch worker absorbs.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Capacity | `QueueFull` | Drop the single offending record, keep going |
//! | Storage | `StorageUnavailable`, `Sqlite`, `Schema` | Surface to caller, no crash |
//! | Lifecycle | `ConfigurationInvalid`, `SchedulerUnavailable`, `NotTracking` | Abort transition, force Stopped |
//! | Upload | [`UploadError`] | Keep batch queued, retry next cycle |
//!
//! ## Why Two Enums?
//!
//! Upload failures never escape a dispatch cycle as `Err` - they are recorded
//! in the cycle's report and the batch simply stays queued. Keeping them in a
//! separate type means `dispatch_pending` only returns `Err` for conditions the
//! caller can actually act on (the store went away).

use thiserror::Error;

// =============================================================================
// Engine Error
// =============================================================================

/// All errors that can occur in engine operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Capacity (absorbed per record by the ingestor)
    // =========================================================================

    /// The queue already holds `capacity` records, or the disk is full.
    ///
    /// # Recovery
    ///
    /// The ingestor treats this as data loss for the single record being
    /// appended and moves on to the next one. Space is reclaimed as soon as a
    /// dispatch cycle gets a batch acknowledged.
    #[error("queue full: capacity of {capacity} records reached")]
    QueueFull {
        /// The configured ceiling at the time of the append.
        capacity: usize,
    },

    // =========================================================================
    // Storage
    // =========================================================================

    /// The underlying store is inaccessible (closed, read-only, corrupted
    /// file, I/O error).
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Raw SQLite failure outside of the append path.
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or unexpected layout.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Configuration failed validation or its endpoint list failed to
    /// serialize. The controller is left Stopped.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// The periodic wake collaborator refused the registration.
    #[error("dispatch scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    /// `reconfigure` was called while the controller was Stopped.
    #[error("controller is not tracking")]
    NotTracking,

    /// The positioning collaborator refused the subscription request.
    #[error("location source refused updates: {0}")]
    LocationSource(String),

    /// Reading a configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Storage Error Classification
// =============================================================================

/// Maps a SQLite failure on the append path onto the engine taxonomy.
///
/// `SQLITE_FULL` means the disk itself ran out of space, which from the
/// ingestor's point of view is the same situation as hitting the configured
/// ceiling: drop this record, keep going.
pub(crate) fn classify_append_failure(err: rusqlite::Error, capacity: usize) -> Error {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DiskFull) => Error::QueueFull { capacity },
        _ => Error::StorageUnavailable(err.to_string()),
    }
}

// =============================================================================
// Upload Errors
// =============================================================================

/// How a failed upload should be treated by the dispatch loop.
///
/// Both classes keep the batch queued. The distinction only changes how loudly
/// the failure is logged: permanent failures usually need an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient: connectivity, timeouts, server-side errors.
    Retryable,
    /// The endpoint will keep rejecting this batch as-is.
    Permanent,
}

/// A single endpoint upload failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Could not reach the endpoint at all.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The request exceeded the per-endpoint timeout.
    #[error("upload timed out")]
    Timeout,

    /// The endpoint answered with a non-success HTTP status.
    #[error("endpoint rejected batch with HTTP {status}")]
    EndpointRejected {
        /// HTTP status code.
        status: u16,
    },

    /// The batch or request could not be built.
    #[error("malformed batch: {0}")]
    Malformed(String),
}

impl UploadError {
    /// Classifies this failure.
    ///
    /// 408 (request timeout) and 429 (too many requests) are client-range
    /// statuses that still clear up on their own, so they count as retryable.
    pub fn class(&self) -> FailureClass {
        match self {
            UploadError::NetworkUnavailable(_) | UploadError::Timeout => FailureClass::Retryable,
            UploadError::EndpointRejected { status } => match status {
                408 | 429 => FailureClass::Retryable,
                400..=499 => FailureClass::Permanent,
                _ => FailureClass::Retryable,
            },
            UploadError::Malformed(_) => FailureClass::Permanent,
        }
    }

    /// Shorthand for `class() == FailureClass::Retryable`.
    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }
}

// =============================================================================
// Tests
// =============================================================================
