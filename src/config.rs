//! # Configuration
//!
//! [`TrackingConfig`] is the value object the host applies through the
//! controller. It is immutable once applied: changing anything means building a
//! new config and calling `reconfigure`, which swaps the [`LiveConfig`] pointer.
//!
//! [`DispatchConfig`] holds the knobs of the dispatch worker itself (batch size,
//! per-endpoint timeout). Those are independent of the transmission interval.
//!
//! ## JSON Form
//!
//! ```json
//! {
//!   "location_update_interval_secs": 300,
//!   "accuracy": "balanced",
//!   "transmission_interval_secs": 21600,
//!   "endpoints": [
//!     { "url": "https://a.example/ingest", "headers": { "x-api-key": "k" } }
//!   ],
//!   "max_queue_capacity": 10000,
//!   "enrichment_fields": ["network_type", "os_version"]
//! }
//! ```
//!
//! Every field except `endpoints` may be omitted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default interval between location updates (5 minutes).
pub const DEFAULT_LOCATION_UPDATE_INTERVAL_SECS: u64 = 300;

/// Default interval between dispatch cycles (6 hours).
pub const DEFAULT_TRANSMISSION_INTERVAL_SECS: u64 = 21_600;

/// Default maximum number of queued fixes.
pub const DEFAULT_MAX_QUEUE_CAPACITY: usize = 10_000;

/// Default number of records per upload batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default per-endpoint upload timeout.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted location update or transmission interval (one year).
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// [`MAX_INTERVAL_SECS`] as a duration.
pub const MAX_INTERVAL: Duration = Duration::from_secs(MAX_INTERVAL_SECS);

fn default_location_update_interval_secs() -> u64 {
    DEFAULT_LOCATION_UPDATE_INTERVAL_SECS
}

fn default_transmission_interval_secs() -> u64 {
    DEFAULT_TRANSMISSION_INTERVAL_SECS
}

fn default_max_queue_capacity() -> usize {
    DEFAULT_MAX_QUEUE_CAPACITY
}

// =============================================================================
// Accuracy
// =============================================================================

/// Requested positioning accuracy / power trade-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyClass {
    #[default]
    High,
    Balanced,
    Low,
    NoPower,
}

// =============================================================================
// Endpoint
// =============================================================================

/// A remote destination for batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Adds a request header (builder pattern).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Checks that the URL and headers can actually be sent.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.url).map_err(|e| {
            Error::ConfigurationInvalid(format!("endpoint url {:?}: {e}", self.url))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::ConfigurationInvalid(format!(
                "endpoint url {:?}: unsupported scheme {:?}",
                self.url,
                url.scheme()
            )));
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                Error::ConfigurationInvalid(format!("endpoint {}: bad header name {name:?}", self.url))
            })?;
            HeaderValue::from_str(value).map_err(|_| {
                Error::ConfigurationInvalid(format!(
                    "endpoint {}: bad value for header {name:?}",
                    self.url
                ))
            })?;
        }

        Ok(())
    }

    /// Parses an endpoint list previously produced by
    /// [`TrackingConfig::endpoints_json`].
    pub fn list_from_json(json: &str) -> Result<Vec<Endpoint>> {
        serde_json::from_str(json)
            .map_err(|e| Error::ConfigurationInvalid(format!("endpoint list: {e}")))
    }
}

// =============================================================================
// Tracking Configuration
// =============================================================================

/// Everything the host decides about tracking and transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_location_update_interval_secs")]
    pub location_update_interval_secs: u64,

    #[serde(default)]
    pub accuracy: AccuracyClass,

    #[serde(default = "default_transmission_interval_secs")]
    pub transmission_interval_secs: u64,

    /// Ordered list of upload destinations. Every batch goes to all of them.
    pub endpoints: Vec<Endpoint>,

    #[serde(default = "default_max_queue_capacity")]
    pub max_queue_capacity: usize,

    /// Enrichment keys to attach. `None` attaches everything the context has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_fields: Option<Vec<String>>,
}

impl TrackingConfig {
    /// Creates a config with default intervals and capacity.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            location_update_interval_secs: DEFAULT_LOCATION_UPDATE_INTERVAL_SECS,
            accuracy: AccuracyClass::default(),
            transmission_interval_secs: DEFAULT_TRANSMISSION_INTERVAL_SECS,
            endpoints,
            max_queue_capacity: DEFAULT_MAX_QUEUE_CAPACITY,
            enrichment_fields: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_location_update_interval(mut self, interval: Duration) -> Self {
        self.location_update_interval_secs = interval.as_secs();
        self
    }

    pub fn with_transmission_interval(mut self, interval: Duration) -> Self {
        self.transmission_interval_secs = interval.as_secs();
        self
    }

    pub fn with_accuracy(mut self, accuracy: AccuracyClass) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_max_queue_capacity(mut self, capacity: usize) -> Self {
        self.max_queue_capacity = capacity;
        self
    }

    pub fn with_enrichment_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enrichment_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn location_update_interval(&self) -> Duration {
        Duration::from_secs(self.location_update_interval_secs)
    }

    pub fn transmission_interval(&self) -> Duration {
        Duration::from_secs(self.transmission_interval_secs)
    }

    /// Rejects configurations the engine cannot act on.
    ///
    /// # Errors
    ///
    /// `Error::ConfigurationInvalid` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::ConfigurationInvalid(
                "no endpoints configured".to_string(),
            ));
        }
        check_interval("location update", self.location_update_interval_secs)?;
        check_interval("transmission", self.transmission_interval_secs)?;
        if self.max_queue_capacity == 0 {
            return Err(Error::ConfigurationInvalid(
                "max queue capacity must be positive".to_string(),
            ));
        }
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }

    /// Serializes the endpoint list for the wake task's persisted extras.
    pub fn endpoints_json(&self) -> Result<String> {
        serde_json::to_string(&self.endpoints)
            .map_err(|e| Error::ConfigurationInvalid(format!("endpoint list: {e}")))
    }

    /// Derives the subscription parameters handed to the location source.
    pub fn location_request(&self) -> LocationRequest {
        LocationRequest::from_interval(self.location_update_interval(), self.accuracy)
    }

    /// Parses a config from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ConfigurationInvalid(e.to_string()))
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl Default for TrackingConfig {
    /// Default intervals and capacity with no endpoints. Fails `validate`
    /// until at least one endpoint is added.
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn check_interval(name: &str, secs: u64) -> Result<()> {
    if (1..=MAX_INTERVAL_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(Error::ConfigurationInvalid(format!(
            "{name} interval must be between 1 and {MAX_INTERVAL_SECS} seconds, got {secs}"
        )))
    }
}

// =============================================================================
// Location Request
// =============================================================================

/// Subscription parameters for the positioning collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    pub interval: Duration,
    /// Fastest rate the source may deliver at: half the interval.
    pub fastest_interval: Duration,
    /// Longest the source may hold fixes back for batched delivery.
    pub max_wait: Duration,
    pub accuracy: AccuracyClass,
}

impl LocationRequest {
    pub fn from_interval(interval: Duration, accuracy: AccuracyClass) -> Self {
        Self {
            interval,
            fastest_interval: interval / 2,
            max_wait: interval.saturating_mul(2).max(interval / 3),
            accuracy,
        }
    }
}

// =============================================================================
// Dispatch Configuration
// =============================================================================

/// Dispatch worker settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum records per uploaded batch.
    pub batch_size: usize,

    /// Upper bound on a single endpoint upload.
    pub upload_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

impl DispatchConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }
}

// =============================================================================
// Live Configuration
// =============================================================================

/// The currently applied configuration, shared between the controller (writer)
/// and the ingestor / wake callback (readers).
///
/// Readers take a cheap `Arc` snapshot and never hold the lock while working.
/// The write lock is held only for the pointer swap.
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    inner: Arc<RwLock<Option<Arc<TrackingConfig>>>>,
}

impl LiveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the applied configuration, if tracking.
    pub fn current(&self) -> Option<Arc<TrackingConfig>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: Arc<TrackingConfig>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// =============================================================================
// Tests
// =============================================================================
