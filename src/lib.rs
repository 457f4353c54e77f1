//! # fixrelay - Durable Location Fix Relay
//!
//! fixrelay collects periodic location fixes, persists them in a SQLite-backed
//! queue, and uploads them in batches to one or more endpoints:
//!
//! - **Durable**: a fix is fsynced before `append` returns and survives restarts
//! - **Bounded**: the queue never grows past its configured capacity
//! - **At-least-once**: a batch is deleted only after every endpoint took it
//! - **Ordered**: newer fixes never go out before older ones
//!
//! ## Architecture Overview
//!
//! ```text
//! positioning ──► Ingestor ──► DurableQueue (queue thread, SQLite)
//!                                   │
//! wake-up ──► DispatchScheduler ──► DispatchWorker ──► endpoints
//!                  ▲
//!          TrackingController (start / stop / reconfigure)
//! ```
//!
//! ## Module Organization
//!
//! - [`error`]: Error types and upload failure classification
//! - [`types`]: Fixes, sequence ids, enrichment
//! - [`config`]: Tracking and dispatch configuration
//! - [`schema`]: SQLite DDL and database initialization
//! - [`codec`]: Stored payload and upload body encoding
//! - [`queue`]: The durable queue and its async handle
//! - [`ingest`]: Enrichment and append
//! - [`upload`]: Upload transport
//! - [`dispatch`]: Batched fan-out dispatch
//! - [`scheduler`]: Periodic wake registration
//! - [`controller`]: Tracking lifecycle
//! - [`engine`]: The wired-up handle (main entry point)

pub mod error;

pub mod types;

/// Tracking configuration, dispatch settings and the live config pointer.
pub mod config;

pub mod schema;

pub mod codec;

/// Durable queue: synchronous store plus async handle to its thread.
pub mod queue;

pub mod ingest;

pub mod upload;

pub mod dispatch;

pub mod scheduler;

pub mod controller;

/// The main entry point is [`Engine`](engine::Engine).
pub mod engine;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    AccuracyClass, DispatchConfig, Endpoint, LiveConfig, LocationRequest, TrackingConfig,
};
pub use controller::{LocationSource, TrackingController, TrackingState, TrackingStatus};
pub use dispatch::{DispatchReport, DispatchWorker, EndpointFailure};
pub use engine::{Collaborators, Engine};
pub use error::{Error, FailureClass, Result, UploadError};
pub use ingest::{ContextEnricher, DeviceIdProvider, Enricher, Ingestor, StaticDeviceId};
pub use queue::{Batch, DurableQueue, QueueStats};
pub use scheduler::{
    DispatchScheduler, NetworkConstraint, PeriodicTask, ScheduleState, TokioWakeScheduler,
    WakeCallback, WakeScheduler, DISPATCH_TASK_IDENTITY,
};
pub use schema::Database;
pub use types::{
    DeviceIdentity, EnrichmentContext, EnrichmentFields, EnrichmentValue, FixRecord, NewFix,
    RawFix, SequenceId,
};
pub use upload::{HttpUploader, Uploader};
