//! # Ingestion
//!
//! Turns deliveries from the positioning collaborator into queued records.
//!
//! For each raw fix, in delivery order:
//!
//! 1. Collect enrichment for the current context, filtered by the config's
//!    allow-list
//! 2. Merge the device identity on top (identity keys always win)
//! 3. Append to the queue
//!
//! A failed append loses only that one fix: it is logged and the rest of the
//! delivery still goes in. There is no retry.

use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::Mutex;

use crate::config::{LiveConfig, TrackingConfig};
use crate::error::Error;
use crate::queue::DurableQueue;
use crate::types::{DeviceIdentity, EnrichmentContext, EnrichmentFields, NewFix, RawFix};

// =============================================================================
// Collaborators
// =============================================================================

/// Resolves the device/advertising identifier.
pub trait DeviceIdProvider: Send + Sync {
    /// `None` when the identifier is not available (yet). Ingestion is skipped.
    fn device_identity(&self) -> Option<DeviceIdentity>;
}

/// Produces the enrichment fields for one fix. Called once per fix.
pub trait Enricher: Send + Sync {
    fn collect(&self, context: &EnrichmentContext, config: &TrackingConfig) -> EnrichmentFields;
}

/// A fixed identity, for hosts that resolve it once at startup.
#[derive(Debug, Clone)]
pub struct StaticDeviceId(pub Option<DeviceIdentity>);

impl DeviceIdProvider for StaticDeviceId {
    fn device_identity(&self) -> Option<DeviceIdentity> {
        self.0.clone()
    }
}

/// Copies the context attributes, keeping only the configured keys when the
/// config has an allow-list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextEnricher;

impl Enricher for ContextEnricher {
    fn collect(&self, context: &EnrichmentContext, config: &TrackingConfig) -> EnrichmentFields {
        match &config.enrichment_fields {
            None => context.attributes.clone(),
            Some(allowed) => context
                .attributes
                .iter()
                .filter(|(key, _)| allowed.iter().any(|a| a == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

// =============================================================================
// Ingestor
// =============================================================================

/// Appends enriched fixes to the queue. One ingest runs at a time.
pub struct Ingestor {
    queue: DurableQueue,
    live: LiveConfig,
    device_ids: Arc<dyn DeviceIdProvider>,
    enricher: Arc<dyn Enricher>,
    in_flight: Mutex<()>,
}

impl Ingestor {
    pub fn new(
        queue: DurableQueue,
        live: LiveConfig,
        device_ids: Arc<dyn DeviceIdProvider>,
        enricher: Arc<dyn Enricher>,
    ) -> Self {
        Self {
            queue,
            live,
            device_ids,
            enricher,
            in_flight: Mutex::new(()),
        }
    }

    /// Enriches and appends `raw` in order. Returns how many were queued.
    ///
    /// Returns 0 without touching the queue when the delivery is empty, when
    /// tracking is not configured, or when no device identity is available.
    pub async fn ingest(&self, raw: Vec<RawFix>, context: &EnrichmentContext) -> usize {
        if raw.is_empty() {
            return 0;
        }

        let _guard = self.in_flight.lock().await;

        let Some(config) = self.live.current() else {
            debug!("dropping {} fixes: tracking not configured", raw.len());
            return 0;
        };

        let Some(identity) = self.device_ids.device_identity() else {
            warn!("dropping {} fixes: device identity unavailable", raw.len());
            return 0;
        };

        let mut appended = 0;
        for fix in &raw {
            let mut enrichment = self.enricher.collect(context, &config);
            identity.merge_into(&mut enrichment);

            match self.queue.append(NewFix::from_raw(fix, enrichment)).await {
                Ok(seq) => {
                    debug!("queued fix {seq} (ts {})", fix.timestamp_ms);
                    appended += 1;
                }
                Err(Error::QueueFull { capacity }) => {
                    warn!(
                        "queue full ({capacity} records), dropping fix at {}",
                        fix.timestamp_ms
                    );
                }
                Err(e) => {
                    error!("failed to queue fix at {}: {e}", fix.timestamp_ms);
                }
            }
        }

        appended
    }
}

// =============================================================================
// Tests
// =============================================================================
