#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Semaphore;

use fixrelay::{
    Collaborators, Database, DeviceIdentity, DispatchConfig, DurableQueue, Endpoint, Engine,
    EnrichmentFields, Error, LocationRequest, LocationSource, NewFix, PeriodicTask, RawFix,
    StaticDeviceId, TrackingConfig, UploadError, Uploader, WakeScheduler,
};

pub const ENDPOINT_A: &str = "https://a.example/ingest";
pub const ENDPOINT_B: &str = "https://b.example/ingest";

// =============================================================================
// Database helpers
// =============================================================================

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

pub fn open_queue(path: &Path, capacity: usize) -> DurableQueue {
    DurableQueue::open(path, capacity).expect("open queue")
}

pub fn memory_queue(capacity: usize) -> DurableQueue {
    DurableQueue::spawn(Database::open_in_memory().unwrap(), capacity).expect("spawn queue")
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn raw(ts: u64) -> RawFix {
    RawFix::new(ts, 52.0 + ts as f64 / 1000.0, 13.0, 10.0)
}

pub fn fix(ts: u64) -> NewFix {
    NewFix::from_raw(&raw(ts), EnrichmentFields::new())
}

pub fn endpoints() -> Vec<Endpoint> {
    vec![Endpoint::new(ENDPOINT_A), Endpoint::new(ENDPOINT_B)]
}

pub fn config() -> TrackingConfig {
    TrackingConfig::new(endpoints())
}

pub fn dispatch_config(batch_size: usize) -> DispatchConfig {
    DispatchConfig::default().with_batch_size(batch_size)
}

// =============================================================================
// Shared call log
// =============================================================================

/// Ordered record of collaborator calls, shared by the recording fakes.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

// =============================================================================
// Scripted uploader
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct UploadCall {
    pub url: String,
    pub sequence_ids: Vec<u64>,
}

/// Uploader whose per-endpoint outcomes are set by the test.
///
/// Outcome order: queued one-shot results first, then a persistent failure,
/// otherwise success.
#[derive(Default)]
pub struct ScriptedUploader {
    calls: Mutex<Vec<UploadCall>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<(), UploadError>>>>,
    failing: Mutex<HashMap<String, UploadError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, outcomes: Vec<Result<(), UploadError>>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.to_string(), outcomes.into());
    }

    pub fn fail(&self, url: &str, error: UploadError) {
        self.failing.lock().unwrap().insert(url.to_string(), error);
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    /// Every upload from now on waits until `release` is called.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> Vec<UploadCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> Vec<Vec<u64>> {
        self.calls()
            .into_iter()
            .filter(|c| c.url == url)
            .map(|c| c.sequence_ids)
            .collect()
    }
}

impl Uploader for ScriptedUploader {
    fn upload(
        &self,
        endpoint: &Endpoint,
        body: &[u8],
    ) -> impl Future<Output = Result<(), UploadError>> + Send {
        let value: serde_json::Value = serde_json::from_slice(body).expect("upload body is JSON");
        let sequence_ids = value["locations"]
            .as_array()
            .expect("locations array")
            .iter()
            .map(|l| l["sequence_id"].as_u64().expect("sequence_id"))
            .collect();
        self.calls.lock().unwrap().push(UploadCall {
            url: endpoint.url.clone(),
            sequence_ids,
        });

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&endpoint.url)
            .and_then(|q| q.pop_front());
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => match self.failing.lock().unwrap().get(&endpoint.url) {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            },
        };
        let gate = self.gate.lock().unwrap().clone();

        async move {
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            outcome
        }
    }
}

// =============================================================================
// Recording location source
// =============================================================================

pub struct RecordingSource {
    log: CallLog,
    refuse: Mutex<bool>,
}

impl RecordingSource {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            refuse: Mutex::new(false),
        })
    }

    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }
}

impl LocationSource for RecordingSource {
    fn request_updates(&self, request: &LocationRequest) -> fixrelay::Result<()> {
        self.log
            .push(format!("request_updates({}s)", request.interval.as_secs()));
        if *self.refuse.lock().unwrap() {
            return Err(Error::LocationSource("permission denied".to_string()));
        }
        Ok(())
    }

    fn remove_updates(&self) {
        self.log.push("remove_updates");
    }
}

// =============================================================================
// Recording wake scheduler
// =============================================================================

/// Wake scheduler that only records registrations; tests fire wakes by hand.
pub struct RecordingWakeScheduler {
    log: CallLog,
    refuse: Mutex<bool>,
    tasks: Mutex<HashMap<String, PeriodicTask>>,
}

impl RecordingWakeScheduler {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            refuse: Mutex::new(false),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }

    pub fn task(&self, identity: &str) -> Option<PeriodicTask> {
        self.tasks.lock().unwrap().get(identity).cloned()
    }

    /// Seeds a registration without logging, as if left by an earlier process.
    pub fn insert(&self, task: PeriodicTask) {
        self.tasks
            .lock()
            .unwrap()
            .insert(task.identity.clone(), task);
    }

    /// Invokes the registered callback once, as the platform would.
    pub async fn fire(&self, identity: &str) {
        let task = self.task(identity).expect("task registered");
        (task.callback)().await;
    }
}

impl WakeScheduler for RecordingWakeScheduler {
    fn schedule(&self, task: PeriodicTask) -> fixrelay::Result<()> {
        self.log.push(format!(
            "schedule({}, {}s)",
            task.identity,
            task.interval.as_secs()
        ));
        if *self.refuse.lock().unwrap() {
            return Err(Error::SchedulerUnavailable("job quota exceeded".to_string()));
        }
        self.tasks
            .lock()
            .unwrap()
            .insert(task.identity.clone(), task);
        Ok(())
    }

    fn cancel(&self, identity: &str) {
        self.log.push(format!("cancel({identity})"));
        self.tasks.lock().unwrap().remove(identity);
    }
}

// =============================================================================
// Engine harness
// =============================================================================

pub type TestEngine = Engine<RecordingSource, RecordingWakeScheduler, ScriptedUploader>;

pub struct Harness {
    pub engine: TestEngine,
    pub log: CallLog,
    pub source: Arc<RecordingSource>,
    pub wake: Arc<RecordingWakeScheduler>,
    pub uploader: Arc<ScriptedUploader>,
}

pub fn harness(queue: DurableQueue, batch_size: usize) -> Harness {
    let log = CallLog::default();
    let source = RecordingSource::new(log.clone());
    let wake = RecordingWakeScheduler::new(log.clone());
    let uploader = ScriptedUploader::new();

    let engine = Engine::new(
        queue,
        Collaborators::new(
            source.clone(),
            wake.clone(),
            uploader.clone(),
            Arc::new(StaticDeviceId(Some(DeviceIdentity::new("device-1")))),
        ),
        dispatch_config(batch_size),
    );

    Harness {
        engine,
        log,
        source,
        wake,
        uploader,
    }
}

// =============================================================================
// Polling
// =============================================================================

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
