//! # Record and Upload Encoding
//!
//! Two formats live here:
//!
//! 1. **Stored payload**: one row per fix, JSON-encoded [`NewFix`] plus an
//!    XXH3-64 checksum. A row whose checksum does not match, or whose payload
//!    no longer parses, is reported as corrupt and skipped by the queue.
//!
//! 2. **Upload body**: what every endpoint receives.
//!
//! ```text
//! {"locations":[
//!   {"sequence_id":7,"utc_timestamp":1700000000,"latitude":..,"longitude":..,
//!    "horizontal_accuracy":..,"course":..,"speed":..,"ad_id":..,...}
//! ]}
//! ```
//!
//! Enrichment keys are flattened next to the fix fields. When an enrichment key
//! collides with a fix field, the fix field wins.

use serde_json::{json, Map, Value};

use crate::error::UploadError;
use crate::types::{FixRecord, NewFix};

// =============================================================================
// Stored Payload
// =============================================================================

/// Why a stored row could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptRecord {
    /// Payload or checksum column is NULL.
    Missing,
    /// Checksum does not match the payload bytes.
    ChecksumMismatch,
    /// Checksum matched but the payload is not a valid fix.
    Undecodable(String),
}

impl std::fmt::Display for CorruptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptRecord::Missing => write!(f, "payload or checksum missing"),
            CorruptRecord::ChecksumMismatch => write!(f, "checksum mismatch"),
            CorruptRecord::Undecodable(e) => write!(f, "undecodable payload: {e}"),
        }
    }
}

/// Encodes a fix for storage.
///
/// Returns `(payload, checksum)`. Serializing a `NewFix` cannot fail for
/// finite values; non-finite floats come out as JSON `null` and are then
/// caught on decode.
pub fn encode_fix(fix: &NewFix) -> (Vec<u8>, Vec<u8>) {
    let payload = serde_json::to_vec(fix).unwrap_or_default();
    let checksum = compute_checksum(&payload);
    (payload, checksum)
}

/// Decodes a stored row, verifying its checksum first.
pub fn decode_fix(
    payload: Option<&[u8]>,
    checksum: Option<&[u8]>,
) -> std::result::Result<NewFix, CorruptRecord> {
    let (payload, checksum) = match (payload, checksum) {
        (Some(p), Some(c)) => (p, c),
        _ => return Err(CorruptRecord::Missing),
    };

    if compute_checksum(payload) != checksum {
        return Err(CorruptRecord::ChecksumMismatch);
    }

    serde_json::from_slice(payload).map_err(|e| CorruptRecord::Undecodable(e.to_string()))
}

/// XXH3-64 of `data`, little endian.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

// =============================================================================
// Upload Body
// =============================================================================

/// Builds the JSON body for one batch.
///
/// # Errors
///
/// `UploadError::Malformed` if the body can't be serialized.
pub fn encode_upload_body(records: &[FixRecord]) -> Result<Vec<u8>, UploadError> {
    let locations: Vec<Value> = records.iter().map(record_to_json).collect();
    serde_json::to_vec(&json!({ "locations": locations }))
        .map_err(|e| UploadError::Malformed(e.to_string()))
}

fn record_to_json(record: &FixRecord) -> Value {
    let mut object = Map::new();

    for (key, value) in &record.enrichment {
        if let Ok(value) = serde_json::to_value(value) {
            object.insert(key.clone(), value);
        }
    }

    object.insert("sequence_id".into(), json!(record.sequence_id.as_raw()));
    object.insert("utc_timestamp".into(), json!(record.timestamp_ms / 1000));
    object.insert("latitude".into(), json!(record.latitude));
    object.insert("longitude".into(), json!(record.longitude));
    object.insert(
        "horizontal_accuracy".into(),
        json!(record.horizontal_accuracy),
    );
    if let Some(course) = record.course {
        object.insert("course".into(), json!(course));
    }
    if let Some(speed) = record.speed {
        object.insert("speed".into(), json!(speed));
    }

    Value::Object(object)
}

// =============================================================================
// Tests
// =============================================================================
