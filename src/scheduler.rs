//! # Dispatch Scheduling
//!
//! Two layers:
//!
//! - [`WakeScheduler`]: the periodic wake-up collaborator. It owns timers and
//!   connectivity gating. [`TokioWakeScheduler`] is the in-process
//!   implementation; hosts with an OS job scheduler plug in their own.
//! - [`DispatchScheduler`]: the `Unscheduled | Scheduled` state machine that
//!   registers the dispatch task and turns each wake into a
//!   `dispatch_pending` call.
//!
//! ## Connectivity
//!
//! The engine never polls the network. A task registered with
//! [`NetworkConstraint::RequiresConnectivity`] is simply not woken while the
//! wake scheduler considers the device offline. `TokioWakeScheduler` reads a
//! `watch::Receiver<bool>`: ticks that land while it reads `false` collapse
//! into a single wake once it flips back to `true`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{Endpoint, LiveConfig, MAX_INTERVAL};
use crate::dispatch::DispatchWorker;
use crate::error::{Error, Result};
use crate::upload::Uploader;

/// Identity of the periodic dispatch task.
pub const DISPATCH_TASK_IDENTITY: &str = "fixrelay.location_dispatch";

// =============================================================================
// Wake Scheduler Collaborator
// =============================================================================

/// When a periodic task may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkConstraint {
    /// Only wake while connected.
    RequiresConnectivity,
    /// Wake regardless of connectivity.
    Any,
}

/// Invoked on every wake.
pub type WakeCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A registration handed to the wake scheduler.
#[derive(Clone)]
pub struct PeriodicTask {
    pub identity: String,
    pub interval: Duration,
    pub network: NetworkConstraint,
    /// Whether the registration should survive a process restart.
    pub persisted: bool,
    /// Opaque data stored with the registration (the endpoint list as JSON).
    pub extras: String,
    pub callback: WakeCallback,
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("identity", &self.identity)
            .field("interval", &self.interval)
            .field("network", &self.network)
            .field("persisted", &self.persisted)
            .field("extras", &self.extras)
            .finish_non_exhaustive()
    }
}

/// Periodic wake-up mechanism.
pub trait WakeScheduler: Send + Sync + 'static {
    /// Registers `task`, replacing any task with the same identity.
    ///
    /// # Errors
    ///
    /// `Error::SchedulerUnavailable` when the registration is refused.
    fn schedule(&self, task: PeriodicTask) -> Result<()>;

    /// Removes every registration for `identity`. No-op if there is none.
    fn cancel(&self, identity: &str);
}

// =============================================================================
// Tokio Wake Scheduler
// =============================================================================

/// In-process wake scheduler: one tokio task per identity.
///
/// Registrations do not survive the process; `persisted` is accepted and
/// ignored. The first wake happens one full interval after `schedule`.
///
/// Cancelling or replacing a registration stops its timer, never a wake in
/// progress: a dispatch cycle that already started runs to completion.
pub struct TokioWakeScheduler {
    handle: Handle,
    connectivity: watch::Receiver<bool>,
    /// Dropping a sender stops the matching timer loop.
    tasks: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl TokioWakeScheduler {
    pub fn new(handle: Handle, connectivity: watch::Receiver<bool>) -> Self {
        Self {
            handle,
            connectivity,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Uses the runtime the caller is running on.
    pub fn from_current(connectivity: watch::Receiver<bool>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::SchedulerUnavailable(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(handle, connectivity))
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl WakeScheduler for TokioWakeScheduler {
    fn schedule(&self, task: PeriodicTask) -> Result<()> {
        if task.interval.is_zero() {
            return Err(Error::SchedulerUnavailable(format!(
                "{}: interval must be positive",
                task.identity
            )));
        }

        let first_wake = Some(task.interval)
            .filter(|interval| *interval <= MAX_INTERVAL)
            .and_then(|interval| Instant::now().checked_add(interval));
        let Some(first_wake) = first_wake else {
            return Err(Error::SchedulerUnavailable(format!(
                "{}: interval {:?} is out of range",
                task.identity, task.interval
            )));
        };

        let identity = task.identity.clone();
        debug!("registering {identity} every {:?}", task.interval);
        let (stop, stopped) = oneshot::channel();
        self.handle.spawn(run_periodic(
            task,
            first_wake,
            self.connectivity.clone(),
            stopped,
        ));

        // The replaced sender is dropped here, which stops the old loop.
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity, stop);
        Ok(())
    }

    fn cancel(&self, identity: &str) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        if removed.is_some() {
            debug!("cancelled {identity}");
        }
    }
}

async fn run_periodic(
    task: PeriodicTask,
    first_wake: Instant,
    mut connectivity: watch::Receiver<bool>,
    mut stopped: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(first_wake, task.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => {
                debug!("{} timer stopped", task.identity);
                return;
            }
            _ = ticker.tick() => {}
        }

        let online = *connectivity.borrow_and_update();
        let deferred = task.network == NetworkConstraint::RequiresConnectivity && !online;
        if deferred {
            debug!("{} deferred until connectivity returns", task.identity);
            let reconnected = tokio::select! {
                _ = &mut stopped => false,
                changed = connectivity.wait_for(|online| *online) => changed.is_ok(),
            };
            if !reconnected {
                debug!("{} stopped while waiting for connectivity", task.identity);
                return;
            }
        }

        // Not raced against `stopped`: a started wake always finishes.

        (task.callback)().await;

        // Missed ticks while offline collapse into the wake above.
        if deferred {
            ticker.reset();
        }
    }
}

// =============================================================================
// Dispatch Scheduler
// =============================================================================

/// Whether the dispatch task is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Scheduled {
        interval: Duration,
        network: NetworkConstraint,
    },
}

/// Registers the periodic dispatch task and routes wakes to the worker.
pub struct DispatchScheduler<S, U> {
    wake: Arc<S>,
    worker: Arc<DispatchWorker<U>>,
    live: LiveConfig,
    state: Mutex<ScheduleState>,
}

impl<S: WakeScheduler, U: Uploader> DispatchScheduler<S, U> {
    pub fn new(wake: Arc<S>, worker: Arc<DispatchWorker<U>>, live: LiveConfig) -> Self {
        Self {
            wake,
            worker,
            live,
            state: Mutex::new(ScheduleState::Unscheduled),
        }
    }

    pub fn state(&self) -> ScheduleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or re-registers) the dispatch task.
    ///
    /// `extras` is stored with the registration and used for the endpoint
    /// list when a wake arrives with no live configuration.
    pub fn schedule_periodic(
        &self,
        interval: Duration,
        network: NetworkConstraint,
        extras: String,
    ) -> Result<()> {
        let task = PeriodicTask {
            identity: DISPATCH_TASK_IDENTITY.to_string(),
            interval,
            network,
            persisted: true,
            extras: extras.clone(),
            callback: self.wake_callback(extras),
        };

        self.wake.schedule(task).map_err(|e| match e {
            Error::SchedulerUnavailable(_) => e,
            other => Error::SchedulerUnavailable(other.to_string()),
        })?;

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) =
            ScheduleState::Scheduled { interval, network };
        info!("dispatch scheduled every {interval:?} ({network:?})");
        Ok(())
    }

    /// Deregisters the dispatch task.
    ///
    /// The wake scheduler is asked even when this process never scheduled
    /// anything: a persisted registration may outlive the process that made
    /// it.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.cancel(DISPATCH_TASK_IDENTITY);
        if *state != ScheduleState::Unscheduled {
            *state = ScheduleState::Unscheduled;
            info!("dispatch schedule cancelled");
        }
    }

    fn wake_callback(&self, extras: String) -> WakeCallback {
        let worker = self.worker.clone();
        let live = self.live.clone();
        let extras: Arc<str> = extras.into();

        Arc::new(move || {
            let worker = worker.clone();
            let live = live.clone();
            let extras = extras.clone();
            async move { on_wake(&worker, &live, &extras).await }.boxed()
        })
    }
}

/// One wake: dispatch to the applied endpoints, or to the persisted ones.
async fn on_wake<U: Uploader>(worker: &DispatchWorker<U>, live: &LiveConfig, extras: &str) {
    let endpoints = match live.current() {
        Some(config) => config.endpoints.clone(),
        None => match Endpoint::list_from_json(extras) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!("wake with unusable persisted endpoints: {e}");
                return;
            }
        },
    };

    match worker.dispatch_pending(&endpoints).await {
        Ok(report) => debug!("wake dispatch finished: {report:?}"),
        Err(e) => error!("wake dispatch failed: {e}"),
    }
}

// =============================================================================
// Tests
// =============================================================================
