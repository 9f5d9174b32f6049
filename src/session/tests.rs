use super::*;
use crate::config::{ConnectionConfig, DiagnosticsConfig, FeedConfig, FeedwatchConfig};
use crate::connection::ConnectionState;
use crate::diagnostics::AlertKind;
use crate::error::RegistryError;
use crate::events::{EventFilter, FeedEvent};
use crate::frame::Frame;
use crate::media::MockSource;
use image::{GrayImage, Luma};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn feed(id: u32) -> FeedConfig {
    FeedConfig {
        id,
        name: format!("Camera {}", id),
        url: format!("mock://camera-{}", id),
    }
}

fn fast_connection() -> ConnectionConfig {
    ConnectionConfig {
        probe_interval_ms: 10,
        serving_interval_ms: 10,
        reconnect_delay_ms: 20,
        read_retry_delay_ms: 10,
        loss_timeout_ms: 1000,
        open_timeout_ms: 200,
        read_timeout_ms: 200,
        join_timeout_ms: 500,
        serving_idle_delay_ms: 10,
        restart_delay_ms: 10,
        serving_direct_reads: false,
        ..ConnectionConfig::default()
    }
}

fn textured(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, _| {
        if (x / 4) % 2 == 0 {
            Luma([10])
        } else {
            Luma([240])
        }
    })
}

type Alerts = Arc<Mutex<Vec<AlertRecord>>>;

fn session_with(source: &MockSource, id: u32) -> (StreamSession, Alerts) {
    let alerts: Alerts = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&alerts);

    let session = StreamSession::builder()
        .feed(feed(id))
        .connection(fast_connection())
        .diagnostics(DiagnosticsConfig::default())
        .source(Arc::new(source.clone()))
        .alert_sink(Arc::new(move |_: u32, alert: &AlertRecord| {
            collected.lock().push(alert.clone());
        }))
        .build()
        .unwrap();

    (session, alerts)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let result = timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_builder_requires_feed_and_source() {
    assert!(StreamSession::builder().feed(feed(1)).build().is_err());
    assert!(StreamSession::builder()
        .source(Arc::new(MockSource::test_pattern(4, 4)))
        .build()
        .is_err());
}

#[tokio::test]
async fn test_status_right_after_start() {
    // first read hangs, so no frame can arrive before the snapshot
    let source = MockSource::builder()
        .then_test_pattern(32, 32)
        .read_delay(Duration::from_millis(150))
        .build();
    let (session, _) = session_with(&source, 1);

    session.start().await;
    let status = session.status();

    assert!(status.running);
    assert!(!status.connected);
    assert_eq!(status.quality_score, 0.0);
    assert!(status.quality_good);
    assert_eq!(status.stats.total_frames, 0);
    assert_eq!(status.stats.frozen_frames, 0);
    assert_eq!(status.stats.low_quality_frames, 0);
    assert_eq!(status.stats.connection_errors, 0);
    assert!(status.stats.last_alert.is_none());
    assert!(session.current_frame().is_none());

    session.stop().await;
    assert!(!session.status().running);
}

#[tokio::test]
async fn test_frozen_alert_reaches_sink() {
    let source = MockSource::builder()
        .frame(Frame::from_luma(0, textured(64, 48)))
        .then_repeat_last()
        .build();
    let (session, alerts) = session_with(&source, 2);

    session.start().await;
    wait_until("frozen alert", || {
        alerts
            .lock()
            .iter()
            .any(|alert| alert.kinds.contains(AlertKind::Frozen))
    })
    .await;
    session.stop().await;

    let status = session.status();
    assert!(status.stats.total_frames >= 4);
    assert!(status.stats.frozen_frames >= 1);
    let last = status.stats.last_alert.expect("last alert recorded");
    assert!(last.message.contains("Camera 2"));
    assert!(last.message.contains("image frozen"));

    // a healthy textured picture keeps the tier good, so only "frozen" fires
    assert!(alerts
        .lock()
        .iter()
        .all(|alert| alert.kinds == crate::diagnostics::AlertSet::from_kinds(&[AlertKind::Frozen])));
}

#[tokio::test]
async fn test_moving_picture_raises_nothing() {
    let source = MockSource::test_pattern(64, 48);
    let (session, alerts) = session_with(&source, 3);

    session.start().await;
    wait_until("frames analysed", || session.status().stats.total_frames >= 8).await;
    session.stop().await;

    assert!(alerts
        .lock()
        .iter()
        .all(|alert| !alert.kinds.contains(AlertKind::Frozen)));
    assert!(session.status().quality_score > 0.0);
}

#[tokio::test]
async fn test_degraded_picture_reports_pixelated() {
    let source = MockSource::builder()
        .frame(Frame::from_luma(0, GrayImage::new(64, 48)))
        .then_repeat_last()
        .build();
    let (session, alerts) = session_with(&source, 4);

    session.simulate_poor_connection();
    assert!(!session.status().quality_good);

    session.start().await;
    wait_until("pixelated alert", || {
        alerts
            .lock()
            .iter()
            .any(|alert| alert.kinds.contains(AlertKind::Pixelated))
    })
    .await;
    session.stop().await;

    assert!(session.status().stats.low_quality_frames >= 1);
}

#[tokio::test]
async fn test_error_sink_sees_open_failures() {
    let source = MockSource::builder()
        .fail_opens(2)
        .then_test_pattern(16, 16)
        .build();
    let messages = Arc::new(Mutex::new(Vec::<String>::new()));
    let collected = Arc::clone(&messages);

    let session = StreamSession::builder()
        .feed(feed(7))
        .connection(fast_connection())
        .source(Arc::new(source.clone()))
        .error_sink(Arc::new(move |message: &str| {
            collected.lock().push(message.to_string());
        }))
        .build()
        .unwrap();
    let mut events = session.subscribe();

    session.start().await;
    wait_until("connection", || session.status().connected).await;
    session.stop().await;

    let messages = messages.lock().clone();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.contains("Camera 7")));
    assert_eq!(session.status().stats.connection_errors, 2);

    let mut error_events = 0;
    while let Ok(event) = events.try_recv() {
        if let FeedEvent::ConnectionError { kind, .. } = event {
            assert_eq!(kind, "connection");
            error_events += 1;
        }
    }
    assert_eq!(error_events, 2);
}

#[tokio::test]
async fn test_inject_test_alerts() {
    let source = MockSource::test_pattern(8, 8);
    let (session, alerts) = session_with(&source, 5);
    let mut events = session.subscribe();

    session.inject_test_alerts();

    let kinds: Vec<AlertKind> = alerts
        .lock()
        .iter()
        .flat_map(|alert| alert.kinds.iter().collect::<Vec<_>>())
        .collect();
    assert_eq!(
        kinds,
        vec![AlertKind::Stopped, AlertKind::Pixelated, AlertKind::Frozen]
    );

    let stats = session.status().stats;
    assert_eq!(stats.stopped_frames, 1);
    assert_eq!(stats.low_quality_frames, 1);
    assert_eq!(stats.frozen_frames, 1);
    assert!(stats.last_alert.unwrap().kinds.contains(AlertKind::Frozen));

    let mut raised = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type() == "alert_raised" {
            raised += 1;
        }
    }
    assert_eq!(raised, 3);
}

#[tokio::test]
async fn test_simulate_poor_connection() {
    let source = MockSource::test_pattern(8, 8);
    let (session, _) = session_with(&source, 6);

    assert!(session.status().quality_good);
    session.simulate_poor_connection();

    let status = session.status();
    assert!(!status.quality_good);
    assert!((status.quality_score - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_reset_stats() {
    let source = MockSource::builder()
        .fail_opens(1)
        .frame(Frame::from_luma(0, textured(32, 32)))
        .then_repeat_last()
        .build();
    let (session, _) = session_with(&source, 8);

    session.start().await;
    wait_until("frozen frames", || session.status().stats.frozen_frames > 0).await;
    session.stop().await;

    let before = session.status();
    assert_eq!(before.stats.connection_errors, 1);
    assert!(before.stats.total_frames > 0);

    session.reset_stats();
    let after = session.status();
    assert_eq!(after.stats.total_frames, 0);
    assert_eq!(after.stats.frozen_frames, 0);
    assert_eq!(after.stats.connection_errors, 0);
    assert!(after.stats.last_alert.is_none());
    assert_eq!(after.quality_score, 0.0);
    assert!(after.quality_good);
}

#[tokio::test]
async fn test_restart() {
    let source = MockSource::test_pattern(16, 16);
    let (session, _) = session_with(&source, 9);

    session.start().await;
    wait_until("first connection", || session.status().connected).await;

    session.restart().await;
    wait_until("second connection", || session.status().connected).await;

    assert_eq!(source.opens(), 2);
    assert_eq!(source.closes(), 1);
    assert!(session.is_running());

    session.stop().await;
    assert_eq!(source.closes(), 2);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_registry_rejects_duplicates_and_removes() {
    let source = MockSource::test_pattern(16, 16);
    let registry = SessionRegistry::new(crate::events::EventBus::new(32));

    let (first, _) = session_with(&source, 1);
    let (second, _) = session_with(&source, 2);
    let (duplicate, _) = session_with(&source, 1);

    registry.register(first).unwrap();
    registry.register(second).unwrap();
    assert!(matches!(
        registry.register(duplicate),
        Err(RegistryError::DuplicateFeed(1))
    ));
    assert_eq!(registry.ids(), vec![1, 2]);

    registry.start_all().await;
    let one = registry.get(1).unwrap();
    wait_until("camera 1 connected", || one.status().connected).await;

    registry.remove(1).await.unwrap();
    assert!(!one.is_running());
    assert!(registry.get(1).is_none());
    assert!(matches!(
        registry.remove(1).await,
        Err(RegistryError::UnknownFeed(1))
    ));

    registry.stop_all().await;
    assert!(registry.statuses().iter().all(|status| !status.running));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_registry_from_config_shares_event_bus() {
    let config = FeedwatchConfig {
        feeds: vec![feed(10), feed(11)],
        connection: fast_connection(),
        ..FeedwatchConfig::default()
    };
    let source: Arc<dyn crate::media::MediaSource> = Arc::new(MockSource::test_pattern(16, 16));
    let registry = SessionRegistry::from_config(&config, source, None, None).unwrap();
    let mut events = registry.subscribe();

    registry.start_all().await;

    let mut connected = std::collections::HashSet::new();
    timeout(Duration::from_secs(5), async {
        while connected.len() < 2 {
            if let Ok(FeedEvent::StateChanged {
                feed_id,
                to: ConnectionState::Connected,
                ..
            }) = events.recv().await
            {
                connected.insert(feed_id);
            }
        }
    })
    .await
    .unwrap();

    registry.stop_all().await;
    let statuses = registry.statuses();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].id, 10);
    assert_eq!(statuses[1].name, "Camera 11");
}

#[tokio::test]
async fn test_registry_filtered_subscription() {
    let config = FeedwatchConfig {
        feeds: vec![feed(20), feed(21)],
        connection: fast_connection(),
        ..FeedwatchConfig::default()
    };
    let source: Arc<dyn crate::media::MediaSource> = Arc::new(MockSource::test_pattern(16, 16));
    let registry = SessionRegistry::from_config(&config, source, None, None).unwrap();
    let mut only_21 = registry.subscribe_filtered(EventFilter::Feeds(vec![21]), "feed-21");
    let mut states = registry.subscribe_filtered(
        EventFilter::EventTypes(vec!["state_changed"]),
        "states",
    );

    registry.start_all().await;

    let event = timeout(Duration::from_secs(5), only_21.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.feed_id(), 21);

    let event = timeout(Duration::from_secs(5), states.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type(), "state_changed");

    registry.stop_all().await;

    while let Some(event) = only_21.try_recv().unwrap() {
        assert_eq!(event.feed_id(), 21);
    }
}
