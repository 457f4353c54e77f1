//! # Tracking Controller
//!
//! Lifecycle state machine over the location subscription and the dispatch
//! schedule.
//!
//! ```text
//!            start(c)                 reconfigure(c')
//! Stopped ─────────────► Tracking ◄──────────────┐
//!    ▲                      │  └──────────────────┘
//!    └──────── stop() ──────┘
//!
//! any transition error ──► stop() ──► Stopped
//! ```
//!
//! Every transition runs under one async lock, and `status()` reads under the
//! same lock, so nobody observes the subscription on one configuration and the
//! schedule on another.
//!
//! ## Failure Policy
//!
//! | Step | On failure |
//! |------|------------|
//! | validate / serialize endpoints | `ConfigurationInvalid`, forced Stopped |
//! | queue capacity | error returned, forced Stopped |
//! | location subscription | logged, tracking continues |
//! | wake registration | `SchedulerUnavailable`, forced Stopped |
//!
//! A refused location subscription does not stop tracking: fixes already in
//! the queue still need to go out.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::config::{LiveConfig, LocationRequest, TrackingConfig};
use crate::error::{Error, Result};
use crate::queue::DurableQueue;
use crate::scheduler::{DispatchScheduler, NetworkConstraint, ScheduleState, WakeScheduler};
use crate::upload::Uploader;

/// The positioning collaborator.
///
/// The adapter that owns the platform subscription forwards every non-empty
/// delivery to [`Ingestor::ingest`](crate::ingest::Ingestor::ingest).
pub trait LocationSource: Send + Sync + 'static {
    fn request_updates(&self, request: &LocationRequest) -> Result<()>;
    fn remove_updates(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Stopped,
    Tracking,
}

/// Consistent snapshot of the controller.
#[derive(Debug, Clone)]
pub struct TrackingStatus {
    pub state: TrackingState,
    pub config: Option<Arc<TrackingConfig>>,
    pub location_request: Option<LocationRequest>,
    pub schedule: ScheduleState,
}

struct Lifecycle {
    state: TrackingState,
    config: Option<Arc<TrackingConfig>>,
    subscribed: bool,
}

pub struct TrackingController<L, S, U> {
    source: Arc<L>,
    scheduler: Arc<DispatchScheduler<S, U>>,
    queue: DurableQueue,
    live: LiveConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl<L: LocationSource, S: WakeScheduler, U: Uploader> TrackingController<L, S, U> {
    pub fn new(
        source: Arc<L>,
        scheduler: Arc<DispatchScheduler<S, U>>,
        queue: DurableQueue,
        live: LiveConfig,
    ) -> Self {
        Self {
            source,
            scheduler,
            queue,
            live,
            lifecycle: Mutex::new(Lifecycle {
                state: TrackingState::Stopped,
                config: None,
                subscribed: false,
            }),
        }
    }

    /// Starts tracking with `config`. While already tracking this behaves
    /// like [`reconfigure`](Self::reconfigure).
    pub async fn start(&self, config: TrackingConfig) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == TrackingState::Tracking {
            info!("start while tracking, applying new configuration");
        }
        self.apply(&mut lifecycle, config).await
    }

    /// Replaces the running configuration as one unit.
    ///
    /// # Errors
    ///
    /// `Error::NotTracking` when stopped; otherwise see the failure policy.
    pub async fn reconfigure(&self, config: TrackingConfig) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == TrackingState::Stopped {
            return Err(Error::NotTracking);
        }
        self.apply(&mut lifecycle, config).await
    }

    /// Stops tracking. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle);
    }

    pub async fn status(&self) -> TrackingStatus {
        let lifecycle = self.lifecycle.lock().await;
        TrackingStatus {
            state: lifecycle.state,
            config: lifecycle.config.clone(),
            location_request: lifecycle.config.as_ref().map(|c| c.location_request()),
            schedule: self.scheduler.state(),
        }
    }

    pub async fn state(&self) -> TrackingState {
        self.lifecycle.lock().await.state
    }

    async fn apply(&self, lifecycle: &mut Lifecycle, config: TrackingConfig) -> Result<()> {
        match self.try_apply(lifecycle, config).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("configuration not applied, stopping: {e}");
                self.stop_locked(lifecycle);
                Err(e)
            }
        }
    }

    async fn try_apply(&self, lifecycle: &mut Lifecycle, config: TrackingConfig) -> Result<()> {
        config.validate()?;
        let extras = config.endpoints_json()?;

        // Stop the running sub-timers; the live config is swapped, not cleared.
        if lifecycle.subscribed {
            self.source.remove_updates();
            lifecycle.subscribed = false;
        }
        if lifecycle.state == TrackingState::Tracking {
            self.scheduler.cancel();
        }

        let config = Arc::new(config);
        self.queue.set_capacity(config.max_queue_capacity).await?;
        self.live.replace(config.clone());

        let request = config.location_request();
        match self.source.request_updates(&request) {
            Ok(()) => lifecycle.subscribed = true,
            Err(e) => warn!("location updates refused, dispatch continues: {e}"),
        }

        let transmission = config.transmission_interval();
        self.scheduler.schedule_periodic(
            transmission,
            NetworkConstraint::RequiresConnectivity,
            extras,
        )?;

        lifecycle.state = TrackingState::Tracking;
        lifecycle.config = Some(config);
        info!(
            "tracking every {:?}, dispatching every {transmission:?}",
            request.interval
        );
        Ok(())
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        let was_tracking = lifecycle.state == TrackingState::Tracking;

        if lifecycle.subscribed {
            self.source.remove_updates();
            lifecycle.subscribed = false;
        }
        self.scheduler.cancel();
        self.live.clear();

        lifecycle.state = TrackingState::Stopped;
        lifecycle.config = None;
        if was_tracking {
            info!("tracking stopped");
        }
    }
}
