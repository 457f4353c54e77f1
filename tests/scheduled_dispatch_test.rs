mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CallLog, RecordingSource, ScriptedUploader, ENDPOINT_A};
use fixrelay::{
    Collaborators, DeviceIdentity, DurableQueue, Engine, EnrichmentContext, StaticDeviceId,
    TokioWakeScheduler,
};
use tokio::sync::watch;

type LiveEngine = Engine<RecordingSource, TokioWakeScheduler, ScriptedUploader>;

fn engine(
    queue: DurableQueue,
    uploader: &Arc<ScriptedUploader>,
    connectivity: watch::Receiver<bool>,
) -> LiveEngine {
    Engine::new(
        queue,
        Collaborators::new(
            RecordingSource::new(CallLog::default()),
            Arc::new(TokioWakeScheduler::from_current(connectivity).unwrap()),
            uploader.clone(),
            Arc::new(StaticDeviceId(Some(DeviceIdentity::new("device-1")))),
        ),
        common::dispatch_config(100),
    )
}

fn every_second() -> fixrelay::TrackingConfig {
    fixrelay::TrackingConfig::new(vec![fixrelay::Endpoint::new(ENDPOINT_A)])
        .with_transmission_interval(Duration::from_secs(1))
}

#[tokio::test]
async fn periodic_wake_drains_queue() {
    let (_online, connectivity) = watch::channel(true);
    let uploader = ScriptedUploader::new();
    let engine = engine(common::memory_queue(100), &uploader, connectivity);

    engine.start(every_second()).await.unwrap();
    engine
        .ingest(vec![common::raw(1), common::raw(2)], &EnrichmentContext::new())
        .await;

    common::eventually(Duration::from_secs(5), Duration::from_millis(20), || {
        (!uploader.calls().is_empty()).then_some(())
    })
    .await;
    assert_eq!(uploader.calls_to(ENDPOINT_A)[0], vec![1, 2]);

    let queue = engine.queue().clone();
    let mut drained = false;
    for _ in 0..50 {
        if queue.size().await.unwrap() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn offline_wakes_wait_for_connectivity() {
    let (online, connectivity) = watch::channel(false);
    let uploader = ScriptedUploader::new();
    let engine = engine(common::memory_queue(100), &uploader, connectivity);

    engine.start(every_second()).await.unwrap();
    engine
        .ingest(vec![common::raw(1)], &EnrichmentContext::new())
        .await;

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(uploader.calls().is_empty());

    online.send(true).unwrap();
    common::eventually(Duration::from_secs(5), Duration::from_millis(20), || {
        (!uploader.calls().is_empty()).then_some(())
    })
    .await;
    // Two missed ticks, one wake.
    assert_eq!(uploader.calls().len(), 1);

    engine.stop().await;
}

#[tokio::test]
async fn stop_cancels_future_wakes() {
    let (_online, connectivity) = watch::channel(true);
    let uploader = ScriptedUploader::new();
    let engine = engine(common::memory_queue(100), &uploader, connectivity);

    engine.start(every_second()).await.unwrap();
    engine.stop().await;
    engine
        .queue()
        .append(common::fix(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(uploader.calls().is_empty());
    assert_eq!(engine.queue().size().await.unwrap(), 1);
}

#[tokio::test]
async fn reconfigure_during_dispatch_lets_cycle_finish() {
    let (_online, connectivity) = watch::channel(true);
    let uploader = ScriptedUploader::new();
    let engine = engine(common::memory_queue(100), &uploader, connectivity);
    let _gate = uploader.hold();

    engine.start(every_second()).await.unwrap();
    engine
        .ingest(vec![common::raw(1), common::raw(2)], &EnrichmentContext::new())
        .await;

    // The first wake is now blocked inside the upload.
    common::eventually(Duration::from_secs(5), Duration::from_millis(20), || {
        (!uploader.calls().is_empty()).then_some(())
    })
    .await;

    engine
        .reconfigure(every_second().with_transmission_interval(Duration::from_secs(3_600)))
        .await
        .unwrap();
    uploader.release();

    let queue = engine.queue().clone();
    let mut drained = false;
    for _ in 0..50 {
        if queue.size().await.unwrap() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained, "acknowledged batch must be deleted");
    assert_eq!(uploader.calls_to(ENDPOINT_A), vec![vec![1, 2]]);

    engine.stop().await;
}
