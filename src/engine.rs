//! # Engine Handle
//!
//! [`Engine`] wires the queue, ingestor, dispatch worker, scheduler and
//! controller together. The host builds exactly one and passes it around
//! explicitly; there is no global instance.
//!
//! ```text
//!             ┌──────────── Engine ─────────────┐
//! LocationSrc │ ingest ──► Ingestor ──┐         │
//!             │                       ▼         │
//!             │               DurableQueue ◄─┐  │
//!             │                       │      │  │
//! WakeSched ──┼─► DispatchScheduler ──► DispatchWorker ──► Uploader
//!             │          ▲                      │
//!             │   TrackingController ── LiveConfig
//!             └─────────────────────────────────┘
//! ```

use std::sync::Arc;

use log::info;

use crate::config::{DispatchConfig, Endpoint, LiveConfig, TrackingConfig};
use crate::controller::{LocationSource, TrackingController, TrackingState, TrackingStatus};
use crate::dispatch::{DispatchReport, DispatchWorker};
use crate::error::{Error, Result};
use crate::ingest::{ContextEnricher, DeviceIdProvider, Enricher, Ingestor};
use crate::queue::{DurableQueue, QueueStats};
use crate::scheduler::{DispatchScheduler, WakeScheduler};
use crate::types::{EnrichmentContext, RawFix};
use crate::upload::Uploader;

/// The external collaborators an engine talks to.
pub struct Collaborators<L, S, U> {
    pub location_source: Arc<L>,
    pub wake_scheduler: Arc<S>,
    pub uploader: Arc<U>,
    pub device_ids: Arc<dyn DeviceIdProvider>,
    pub enricher: Arc<dyn Enricher>,
}

impl<L, S, U> Collaborators<L, S, U> {
    /// Collaborators with the default [`ContextEnricher`].
    pub fn new(
        location_source: Arc<L>,
        wake_scheduler: Arc<S>,
        uploader: Arc<U>,
        device_ids: Arc<dyn DeviceIdProvider>,
    ) -> Self {
        Self {
            location_source,
            wake_scheduler,
            uploader,
            device_ids,
            enricher: Arc::new(ContextEnricher),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }
}

/// The fix relay engine.
pub struct Engine<L, S, U> {
    queue: DurableQueue,
    live: LiveConfig,
    ingestor: Ingestor,
    worker: Arc<DispatchWorker<U>>,
    controller: TrackingController<L, S, U>,
}

impl<L: LocationSource, S: WakeScheduler, U: Uploader> Engine<L, S, U> {
    /// Wires an engine over an already opened queue.
    pub fn new(
        queue: DurableQueue,
        collaborators: Collaborators<L, S, U>,
        dispatch: DispatchConfig,
    ) -> Self {
        let live = LiveConfig::new();

        let ingestor = Ingestor::new(
            queue.clone(),
            live.clone(),
            collaborators.device_ids,
            collaborators.enricher,
        );
        let worker = Arc::new(DispatchWorker::new(
            queue.clone(),
            collaborators.uploader,
            dispatch,
        ));
        let scheduler = Arc::new(DispatchScheduler::new(
            collaborators.wake_scheduler,
            worker.clone(),
            live.clone(),
        ));
        let controller = TrackingController::new(
            collaborators.location_source,
            scheduler,
            queue.clone(),
            live.clone(),
        );

        Self {
            queue,
            live,
            ingestor,
            worker,
            controller,
        }
    }

    pub async fn start(&self, config: TrackingConfig) -> Result<()> {
        self.controller.start(config).await
    }

    pub async fn reconfigure(&self, config: TrackingConfig) -> Result<()> {
        self.controller.reconfigure(config).await
    }

    pub async fn stop(&self) {
        self.controller.stop().await
    }

    pub async fn status(&self) -> TrackingStatus {
        self.controller.status().await
    }

    pub async fn state(&self) -> TrackingState {
        self.controller.state().await
    }

    /// Entry point for the location source adapter.
    pub async fn ingest(&self, raw: Vec<RawFix>, context: &EnrichmentContext) -> usize {
        self.ingestor.ingest(raw, context).await
    }

    /// Runs one dispatch cycle against explicit endpoints.
    pub async fn dispatch_pending(&self, endpoints: &[Endpoint]) -> Result<DispatchReport> {
        self.worker.dispatch_pending(endpoints).await
    }

    /// Runs one dispatch cycle now against the applied endpoints.
    ///
    /// # Errors
    ///
    /// `Error::NotTracking` when no configuration is applied.
    pub async fn flush(&self) -> Result<DispatchReport> {
        let config = self.live.current().ok_or(Error::NotTracking)?;
        self.worker.dispatch_pending(&config.endpoints).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    /// Stops tracking and closes the queue.
    pub async fn shutdown(self) -> Result<()> {
        self.controller.stop().await;
        self.queue.shutdown().await?;
        info!("engine shut down");
        Ok(())
    }
}
