//! # Domain Types for fixrelay
//!
//! This module defines the values that flow through the engine: raw fixes from
//! the positioning collaborator, enriched fixes waiting in the queue, and the
//! identity/context inputs used to enrich them.
//!
//! ## Lifecycle of a Fix
//!
//! ```text
//! RawFix ──(Ingestor: + enrichment + identity)──► NewFix
//!        ──(DurableQueue::append assigns id)────► FixRecord
//!        ──(DispatchWorker: acknowledged)───────► deleted
//! ```
//!
//! ## Invariants
//!
//! - [`SequenceId`]: strictly increasing, never reused, never zero
//! - [`FixRecord`]: immutable once created

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Sequence Ids
// =============================================================================

/// Position of a record in the durable queue.
///
/// # Invariants
///
/// - Assigned by the queue on append, never by callers
/// - Strictly increases with each append
/// - Never reused, even after the queue is completely drained
/// - Starts at 1 (zero is never handed out)
///
/// # Rust Pattern: Copy
///
/// `SequenceId` is 8 bytes and passed around constantly (peek, delete,
/// reports), so it is `Copy` like any other small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    /// The first id the queue will ever assign.
    pub const FIRST: SequenceId = SequenceId(1);

    /// Creates a SequenceId from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is 0.
    pub fn from_raw(value: u64) -> Self {
        assert!(value > 0, "SequenceId cannot be zero");
        Self(value)
    }

    /// Converts a SQLite row id. `None` for ids that are not positive.
    pub(crate) fn from_row(value: i64) -> Option<Self> {
        u64::try_from(value).ok().filter(|v| *v > 0).map(Self)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the value as SQLite stores it. `None` beyond SQLite's range,
    /// where no row can exist.
    pub(crate) fn as_row(&self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enrichment
// =============================================================================

/// A single enrichment value.
///
/// The queue never interprets these; they are carried verbatim into the upload
/// body. `untagged` keeps the JSON form natural: `"wifi"`, `42.0`, `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnrichmentValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for EnrichmentValue {
    fn from(s: &str) -> Self {
        EnrichmentValue::Text(s.to_string())
    }
}

impl From<String> for EnrichmentValue {
    fn from(s: String) -> Self {
        EnrichmentValue::Text(s)
    }
}

impl From<f64> for EnrichmentValue {
    fn from(n: f64) -> Self {
        EnrichmentValue::Number(n)
    }
}

impl From<bool> for EnrichmentValue {
    fn from(b: bool) -> Self {
        EnrichmentValue::Flag(b)
    }
}

/// Enrichment key → value mapping.
///
/// A `BTreeMap` so the stored payload (and therefore its checksum) is
/// deterministic for the same content.
pub type EnrichmentFields = BTreeMap<String, EnrichmentValue>;

/// Enrichment key carrying the device identifier.
pub const FIELD_DEVICE_ID: &str = "ad_id";

/// Enrichment key carrying the "limit tracking" preference.
pub const FIELD_LIMIT_TRACKING: &str = "ad_opt_out";

/// Enrichment key naming the kind of device identifier.
pub const FIELD_ID_TYPE: &str = "id_type";

/// Identifier type reported for advertising ids.
pub const ID_TYPE_ADVERTISING: &str = "aaid";

/// Device identity resolved by the device-identifier collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Opaque identifier.
    pub id: String,

    /// Whether the user asked to limit tracking with this identifier.
    pub limit_tracking: bool,
}

impl DeviceIdentity {
    /// Creates an identity that does not limit tracking.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            limit_tracking: false,
        }
    }

    /// Sets the limit-tracking flag (builder pattern).
    pub fn with_limit_tracking(mut self, limit_tracking: bool) -> Self {
        self.limit_tracking = limit_tracking;
        self
    }

    /// Writes this identity into an enrichment map.
    pub fn merge_into(&self, fields: &mut EnrichmentFields) {
        fields.insert(FIELD_DEVICE_ID.to_string(), self.id.clone().into());
        fields.insert(FIELD_LIMIT_TRACKING.to_string(), self.limit_tracking.into());
        fields.insert(FIELD_ID_TYPE.to_string(), ID_TYPE_ADVERTISING.into());
    }
}

/// Device context handed to the enrichment collaborator.
///
/// The host adapter fills this with whatever it knows about the device and
/// network at delivery time (model, OS version, connection type, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentContext {
    pub attributes: EnrichmentFields,
}

impl EnrichmentContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute (builder pattern).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<EnrichmentValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Fixes
// =============================================================================

/// A location fix exactly as the positioning collaborator delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    /// When the fix was taken (Unix milliseconds).
    pub timestamp_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in metres.
    pub horizontal_accuracy: f64,
    /// Bearing in degrees, when the platform reports one.
    #[serde(default)]
    pub course: Option<f64>,
    /// Ground speed in metres per second, when the platform reports one.
    #[serde(default)]
    pub speed: Option<f64>,
}

impl RawFix {
    /// Creates a fix without course or speed.
    pub fn new(timestamp_ms: u64, latitude: f64, longitude: f64, horizontal_accuracy: f64) -> Self {
        Self {
            timestamp_ms,
            latitude,
            longitude,
            horizontal_accuracy,
            course: None,
            speed: None,
        }
    }
}

/// An enriched fix that has not been assigned a sequence id yet.
///
/// This is the "input" form of [`FixRecord`] - what the ingestor hands to
/// [`DurableQueue::append`](crate::queue::DurableQueue::append). It is also
/// the exact shape stored in the queue's payload column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFix {
    pub timestamp_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub horizontal_accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default)]
    pub enrichment: EnrichmentFields,
}

impl NewFix {
    /// Builds an enriched fix from a raw fix and its enrichment fields.
    pub fn from_raw(raw: &RawFix, enrichment: EnrichmentFields) -> Self {
        Self {
            timestamp_ms: raw.timestamp_ms,
            latitude: raw.latitude,
            longitude: raw.longitude,
            horizontal_accuracy: raw.horizontal_accuracy,
            course: raw.course,
            speed: raw.speed,
            enrichment,
        }
    }
}

/// A stored fix with its queue position.
///
/// This is the "output" form - what `peek_batch` returns and what gets
/// uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct FixRecord {
    pub sequence_id: SequenceId,
    pub timestamp_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub horizontal_accuracy: f64,
    pub course: Option<f64>,
    pub speed: Option<f64>,
    pub enrichment: EnrichmentFields,
}

impl FixRecord {
    /// Attaches a sequence id to a stored fix.
    pub fn new(sequence_id: SequenceId, fix: NewFix) -> Self {
        Self {
            sequence_id,
            timestamp_ms: fix.timestamp_ms,
            latitude: fix.latitude,
            longitude: fix.longitude,
            horizontal_accuracy: fix.horizontal_accuracy,
            course: fix.course,
            speed: fix.speed,
            enrichment: fix.enrichment,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
