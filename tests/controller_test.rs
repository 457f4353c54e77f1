mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ENDPOINT_A, ENDPOINT_B};
use fixrelay::{
    Endpoint, EnrichmentContext, Error, NetworkConstraint, ScheduleState, TrackingState,
    DISPATCH_TASK_IDENTITY,
};

fn schedule_entry(secs: u64) -> String {
    format!("schedule({DISPATCH_TASK_IDENTITY}, {secs}s)")
}

fn cancel_entry() -> String {
    format!("cancel({DISPATCH_TASK_IDENTITY})")
}

#[tokio::test]
async fn start_subscribes_then_schedules() {
    let h = common::harness(common::memory_queue(10_000), 100);

    let config = common::config().with_max_queue_capacity(50);
    h.engine.start(config).await.unwrap();

    assert_eq!(
        h.log.entries(),
        vec!["request_updates(300s)".to_string(), schedule_entry(21_600)]
    );

    let status = h.engine.status().await;
    assert_eq!(status.state, TrackingState::Tracking);
    assert_eq!(
        status.schedule,
        ScheduleState::Scheduled {
            interval: Duration::from_secs(21_600),
            network: NetworkConstraint::RequiresConnectivity,
        }
    );
    let request = status.location_request.unwrap();
    assert_eq!(request.fastest_interval, Duration::from_secs(150));
    assert_eq!(request.max_wait, Duration::from_secs(600));
    assert_eq!(h.engine.queue().capacity().await.unwrap(), 50);

    let task = h.wake.task(DISPATCH_TASK_IDENTITY).unwrap();
    assert!(task.persisted);
    assert_eq!(
        Endpoint::list_from_json(&task.extras).unwrap(),
        common::endpoints()
    );
}

#[tokio::test]
async fn reconfigure_stops_then_starts_with_new_config() {
    let h = common::harness(common::memory_queue(100), 100);
    h.engine.start(common::config()).await.unwrap();
    h.log.clear();

    let next = common::config()
        .with_location_update_interval(Duration::from_secs(60))
        .with_transmission_interval(Duration::from_secs(3_600));
    h.engine.reconfigure(next).await.unwrap();

    assert_eq!(
        h.log.entries(),
        vec![
            "remove_updates".to_string(),
            cancel_entry(),
            "request_updates(60s)".to_string(),
            schedule_entry(3_600),
        ]
    );

    let status = h.engine.status().await;
    assert_eq!(status.state, TrackingState::Tracking);
    assert_eq!(status.config.unwrap().transmission_interval_secs, 3_600);
    assert_eq!(status.location_request.unwrap().interval, Duration::from_secs(60));
}

#[tokio::test]
async fn start_while_tracking_acts_as_reconfigure() {
    let h = common::harness(common::memory_queue(100), 100);
    h.engine.start(common::config()).await.unwrap();
    h.log.clear();

    h.engine
        .start(common::config().with_transmission_interval(Duration::from_secs(120)))
        .await
        .unwrap();

    assert_eq!(
        h.log.entries(),
        vec![
            "remove_updates".to_string(),
            cancel_entry(),
            "request_updates(300s)".to_string(),
            schedule_entry(120),
        ]
    );
}

#[tokio::test]
async fn reconfigure_requires_tracking() {
    let h = common::harness(common::memory_queue(100), 100);

    let err = h.engine.reconfigure(common::config()).await.unwrap_err();
    assert!(matches!(err, Error::NotTracking));
    assert!(h.log.entries().is_empty());
}

#[tokio::test]
async fn invalid_config_forces_stopped() {
    let h = common::harness(common::memory_queue(100), 100);

    let err = h
        .engine
        .start(fixrelay::TrackingConfig::new(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigurationInvalid(_)));
    assert_eq!(h.engine.state().await, TrackingState::Stopped);
    // The forced stop still clears any registration left from an earlier run.
    assert_eq!(h.log.entries(), vec![cancel_entry()]);

    h.engine.start(common::config()).await.unwrap();
    h.log.clear();

    let broken = fixrelay::TrackingConfig::new(vec![Endpoint::new("not a url")]);
    let err = h.engine.reconfigure(broken).await.unwrap_err();
    assert!(matches!(err, Error::ConfigurationInvalid(_)));

    let status = h.engine.status().await;
    assert_eq!(status.state, TrackingState::Stopped);
    assert!(status.config.is_none());
    assert_eq!(status.schedule, ScheduleState::Unscheduled);
    assert_eq!(
        h.log.entries(),
        vec!["remove_updates".to_string(), cancel_entry()]
    );
}

#[tokio::test]
async fn scheduler_refusal_forces_stopped() {
    let h = common::harness(common::memory_queue(100), 100);
    h.wake.refuse(true);

    let err = h.engine.start(common::config()).await.unwrap_err();
    assert!(matches!(err, Error::SchedulerUnavailable(_)));

    let status = h.engine.status().await;
    assert_eq!(status.state, TrackingState::Stopped);
    assert_eq!(status.schedule, ScheduleState::Unscheduled);
    // The subscription made before the refusal is undone.
    assert_eq!(
        h.log.entries(),
        vec![
            "request_updates(300s)".to_string(),
            schedule_entry(21_600),
            "remove_updates".to_string(),
            cancel_entry(),
        ]
    );
}

#[tokio::test]
async fn location_refusal_keeps_dispatch_running() {
    let h = common::harness(common::memory_queue(100), 100);
    h.source.refuse(true);

    h.engine.start(common::config()).await.unwrap();

    let status = h.engine.status().await;
    assert_eq!(status.state, TrackingState::Tracking);
    assert!(matches!(status.schedule, ScheduleState::Scheduled { .. }));

    h.log.clear();
    h.engine.stop().await;
    // Nothing to unsubscribe.
    assert_eq!(h.log.entries(), vec![cancel_entry()]);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = common::harness(common::memory_queue(100), 100);
    h.engine.start(common::config()).await.unwrap();
    h.log.clear();

    h.engine.stop().await;
    h.engine.stop().await;

    assert_eq!(
        h.log.entries(),
        vec!["remove_updates".to_string(), cancel_entry(), cancel_entry()]
    );
    assert_eq!(h.engine.state().await, TrackingState::Stopped);
    assert!(matches!(h.engine.flush().await, Err(Error::NotTracking)));
}

#[tokio::test]
async fn stop_on_fresh_engine_cancels_persisted_registration() {
    let h = common::harness(common::memory_queue(100), 100);

    // A registration made by a previous process is still held by the platform.
    h.engine.start(common::config()).await.unwrap();
    let persisted = h.wake.task(DISPATCH_TASK_IDENTITY).unwrap();

    let fresh = common::harness(common::memory_queue(100), 100);
    fresh.wake.insert(persisted);
    fresh.engine.stop().await;

    assert_eq!(fresh.log.entries(), vec![cancel_entry()]);
    assert!(fresh.wake.task(DISPATCH_TASK_IDENTITY).is_none());
}

#[tokio::test]
async fn wake_dispatches_to_applied_endpoints() {
    let h = common::harness(common::memory_queue(100), 100);
    h.engine.start(common::config()).await.unwrap();

    let queued = h
        .engine
        .ingest(vec![common::raw(1), common::raw(2)], &EnrichmentContext::new())
        .await;
    assert_eq!(queued, 2);

    h.wake.fire(DISPATCH_TASK_IDENTITY).await;

    assert_eq!(h.uploader.calls_to(ENDPOINT_A), vec![vec![1, 2]]);
    assert_eq!(h.uploader.calls_to(ENDPOINT_B), vec![vec![1, 2]]);
    assert_eq!(h.engine.queue_stats().await.unwrap().len, 0);
}

#[tokio::test]
async fn wake_without_live_config_uses_persisted_endpoints() {
    let h = common::harness(common::memory_queue(100), 100);
    h.engine
        .start(common::config().with_transmission_interval(Duration::from_secs(60)))
        .await
        .unwrap();
    h.engine
        .ingest(vec![common::raw(1)], &EnrichmentContext::new())
        .await;

    // Keep the registration, drop the live config: a wake delivered to a
    // freshly restarted process looks like this.
    let task = h.wake.task(DISPATCH_TASK_IDENTITY).unwrap();
    h.engine.stop().await;
    (task.callback)().await;

    assert_eq!(h.uploader.calls_to(ENDPOINT_A), vec![vec![1]]);
    assert_eq!(h.uploader.calls_to(ENDPOINT_B), vec![vec![1]]);
}

#[tokio::test]
async fn status_never_mixes_configurations() {
    let h = Arc::new(common::harness(common::memory_queue(100), 100));
    h.engine
        .start(
            common::config()
                .with_location_update_interval(Duration::from_secs(100))
                .with_transmission_interval(Duration::from_secs(1_000)),
        )
        .await
        .unwrap();

    let writer = {
        let h = h.clone();
        tokio::spawn(async move {
            for i in 0..50u64 {
                let secs = 100 + (i % 2) * 100;
                let config = common::config()
                    .with_location_update_interval(Duration::from_secs(secs))
                    .with_transmission_interval(Duration::from_secs(secs * 10));
                h.engine.reconfigure(config).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for _ in 0..200 {
        let status = h.engine.status().await;
        let config = status.config.expect("tracking throughout");
        assert_eq!(
            status.location_request.unwrap().interval.as_secs() * 10,
            config.transmission_interval_secs
        );
        assert_eq!(
            status.schedule,
            ScheduleState::Scheduled {
                interval: config.transmission_interval(),
                network: NetworkConstraint::RequiresConnectivity,
            }
        );
        tokio::task::yield_now().await;
    }

    writer.await.unwrap();
}
