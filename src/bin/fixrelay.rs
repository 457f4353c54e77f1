//! fixrelay host binary.
//!
//! Reads location fixes as JSON lines on stdin, queues them durably and uploads
//! them on the configured schedule.
//!
//! ```bash
//! fixrelay run --config tracking.json --db fixes.db --device-id abc < fixes.jsonl
//! fixrelay flush --config tracking.json --db fixes.db
//! fixrelay status --db fixes.db
//! ```
//!
//! Each stdin line is one fix object or an array of them:
//!
//! ```json
//! {"timestamp_ms":1700000000000,"latitude":52.5,"longitude":13.4,"horizontal_accuracy":8.0}
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use fixrelay::{
    Collaborators, DeviceIdentity, DispatchConfig, DispatchWorker, DurableQueue, Engine,
    EnrichmentContext, HttpUploader, LocationRequest, LocationSource, RawFix, StaticDeviceId,
    TokioWakeScheduler, TrackingConfig,
};

#[derive(Parser)]
#[command(name = "fixrelay")]
#[command(about = "Durable location fix queue with batched upload")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track fixes from stdin and dispatch them periodically
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        db: PathBuf,
        /// Device identifier attached to every fix
        #[arg(long, default_value = "local")]
        device_id: String,
        /// Mark the device identifier as limit-tracking
        #[arg(long)]
        limit_tracking: bool,
    },
    /// Run one dispatch cycle now
    Flush {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        db: PathBuf,
    },
    /// Show queue size, capacity and oldest pending fix
    Status {
        /// Config supplying the capacity (default capacity otherwise)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db: PathBuf,
    },
}

/// One stdin line.
#[derive(Deserialize)]
#[serde(untagged)]
enum Delivery {
    Many(Vec<RawFix>),
    One(RawFix),
}

impl Delivery {
    fn into_fixes(self) -> Vec<RawFix> {
        match self {
            Delivery::Many(fixes) => fixes,
            Delivery::One(fix) => vec![fix],
        }
    }
}

/// Location source for the stdin feed: the subscription is implicit.
struct StdinSource;

impl LocationSource for StdinSource {
    fn request_updates(&self, request: &LocationRequest) -> fixrelay::Result<()> {
        info!(
            "accepting fixes (interval {:?}, accuracy {:?})",
            request.interval, request.accuracy
        );
        Ok(())
    }

    fn remove_updates(&self) {
        debug!("stdin source unsubscribed");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            config,
            db,
            device_id,
            limit_tracking,
        } => {
            let identity = DeviceIdentity::new(device_id).with_limit_tracking(limit_tracking);
            run(&config, &db, identity).await
        }
        Commands::Flush { config, db } => flush(&config, &db).await,
        Commands::Status { config, db } => status(config.as_deref(), &db).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: &Path, db: &Path, identity: DeviceIdentity) -> fixrelay::Result<()> {
    let config = TrackingConfig::from_json_file(config_path)?;
    let dispatch = DispatchConfig::default();

    let queue = DurableQueue::open(db, config.max_queue_capacity)?;
    // No platform connectivity signal on a plain host: always online.
    let (_online, connectivity) = watch::channel(true);
    let collaborators = Collaborators::new(
        Arc::new(StdinSource),
        Arc::new(TokioWakeScheduler::from_current(connectivity)?),
        Arc::new(HttpUploader::new(dispatch.upload_timeout)?),
        Arc::new(StaticDeviceId(Some(identity))),
    );
    let engine = Engine::new(queue, collaborators, dispatch);

    engine.start(config).await?;

    let context = EnrichmentContext::new().with("os", std::env::consts::OS);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<Delivery>(&line) {
                    Ok(delivery) => {
                        let queued = engine.ingest(delivery.into_fixes(), &context).await;
                        debug!("queued {queued} fixes");
                    }
                    Err(e) => warn!("ignoring unparseable line: {e}"),
                },
                None => {
                    info!("stdin closed, flushing before exit");
                    let report = engine.flush().await?;
                    info!("final flush: {report:?}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    engine.shutdown().await
}

async fn flush(config_path: &Path, db: &Path) -> fixrelay::Result<()> {
    let config = TrackingConfig::from_json_file(config_path)?;
    config.validate()?;
    let dispatch = DispatchConfig::default();

    let queue = open_existing(db, config.max_queue_capacity)?;
    let uploader = Arc::new(HttpUploader::new(dispatch.upload_timeout)?);
    let worker = DispatchWorker::new(queue.clone(), uploader, dispatch);

    let report = worker.dispatch_pending(&config.endpoints).await?;
    println!(
        "sent {} fixes in {} batches, {} still pending in the halted batch, {} corrupt purged",
        report.sent, report.batches, report.failed, report.purged
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.endpoint_url, failure.error);
    }

    queue.shutdown().await
}

async fn status(config_path: Option<&Path>, db: &Path) -> fixrelay::Result<()> {
    let capacity = match config_path {
        Some(path) => TrackingConfig::from_json_file(path)?.max_queue_capacity,
        None => fixrelay::config::DEFAULT_MAX_QUEUE_CAPACITY,
    };
    let queue = open_existing(db, capacity)?;
    let stats = queue.stats().await?;

    println!("pending fixes: {} / {}", stats.len, stats.capacity);
    match stats.oldest_timestamp_ms {
        Some(ms) => println!("oldest fix:    {ms} ms since epoch"),
        None => println!("oldest fix:    -"),
    }

    queue.shutdown().await
}

/// Opens a queue database that must already exist. Only `run` creates one.
fn open_existing(db: &Path, capacity: usize) -> fixrelay::Result<DurableQueue> {
    if !db.exists() {
        return Err(fixrelay::Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no queue database at {}", db.display()),
        )));
    }
    DurableQueue::open(db, capacity)
}
