use super::*;
use crate::config::ConnectionConfig;
use crate::events::{EventBus, FeedEvent};
use crate::frame::Frame;
use crate::media::MockSource;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        probe_interval_ms: 10,
        serving_interval_ms: 10,
        reconnect_delay_ms: 20,
        read_retry_delay_ms: 10,
        loss_timeout_ms: 150,
        open_timeout_ms: 100,
        read_timeout_ms: 100,
        join_timeout_ms: 500,
        serving_idle_delay_ms: 10,
        ..ConnectionConfig::default()
    }
}

fn manager(source: &MockSource, config: ConnectionConfig, bus: &EventBus) -> ConnectionManager {
    ConnectionManager::builder()
        .feed_id(1)
        .address("mock://camera-1")
        .config(config)
        .source(Arc::new(source.clone()))
        .event_bus(bus.clone())
        .build()
        .unwrap()
}

/// Collect state transitions until `target` is reached
async fn states_until(
    rx: &mut broadcast::Receiver<FeedEvent>,
    target: ConnectionState,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    let wait = async {
        loop {
            if let Ok(FeedEvent::StateChanged { to, .. }) = rx.recv().await {
                seen.push(to);
                if to == target {
                    break;
                }
            }
        }
    };
    timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for state");
    seen
}

#[tokio::test]
async fn test_builder_requires_source_and_address() {
    assert!(ConnectionManager::builder().address("mock://x").build().is_err());
    assert!(ConnectionManager::builder()
        .source(Arc::new(MockSource::test_pattern(4, 4)))
        .build()
        .is_err());
}

#[tokio::test]
async fn test_open_failures_then_connect() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let source = MockSource::builder()
        .fail_opens(3)
        .then_test_pattern(32, 24)
        .build();

    let errors = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&errors);
    let manager = ConnectionManager::builder()
        .feed_id(1)
        .address("mock://camera-1")
        .config(fast_config())
        .source(Arc::new(source.clone()))
        .error_sink(Arc::new(move |_: &str| {
            counted.fetch_add(1, Ordering::SeqCst);
        }))
        .event_bus(bus.clone())
        .build()
        .unwrap();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    manager.start().await;

    let seen = states_until(&mut rx, ConnectionState::Connected).await;
    use ConnectionState::*;
    assert_eq!(
        seen,
        vec![
            Connecting,
            Disconnected,
            Connecting,
            Disconnected,
            Connecting,
            Disconnected,
            Connecting,
            Connected
        ]
    );
    assert_eq!(manager.connection_errors(), 3);
    assert_eq!(errors.load(Ordering::SeqCst), 3);
    assert_eq!(manager.stats().connects, 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_stop_mid_sleep_closes_handle_once() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let source = MockSource::test_pattern(16, 16);
    let config = ConnectionConfig {
        // both loops spend their time sleeping
        probe_interval_ms: 10_000,
        serving_interval_ms: 10_000,
        loss_timeout_ms: 20_000,
        join_timeout_ms: 1000,
        ..fast_config()
    };
    let manager = manager(&source, config, &bus);

    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;
    assert!(manager.is_running());

    let started = Instant::now();
    manager.stop().await;
    assert!(started.elapsed() < Duration::from_millis(1000));

    assert_eq!(source.opens(), 1);
    assert_eq!(source.closes(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_frame().is_none());
    assert!(!manager.is_running());

    manager.stop().await;
    assert_eq!(source.closes(), 1);
}

#[tokio::test]
async fn test_stop_aborts_hung_read_and_still_closes() {
    let bus = EventBus::new(64);
    let source = MockSource::builder()
        .then_test_pattern(8, 8)
        .read_delay(Duration::from_secs(30))
        .build();
    let config = ConnectionConfig {
        read_timeout_ms: 60_000,
        join_timeout_ms: 200,
        ..fast_config()
    };
    let manager = manager(&source, config, &bus);

    manager.start().await;
    timeout(Duration::from_secs(2), async {
        while source.opens() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let started = Instant::now();
    manager.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(source.closes(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_current_frame_only_while_connected() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let source = MockSource::test_pattern(16, 12);
    let manager = manager(&source, fast_config(), &bus);

    assert!(manager.current_frame().is_none());

    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;

    let frame = manager.current_frame().expect("frame while connected");
    assert_eq!((frame.width, frame.height), (16, 12));

    manager.stop().await;
    assert!(manager.current_frame().is_none());
}

#[tokio::test]
async fn test_loss_then_reconnect() {
    let bus = EventBus::new(256);
    let mut rx = bus.subscribe();
    let source = MockSource::test_pattern(8, 8);
    let manager = manager(&source, fast_config(), &bus);

    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;

    source.set_reads_failing(true);
    states_until(&mut rx, ConnectionState::Lost).await;
    assert!(manager.connection_errors() > 0);
    assert!(source.closes() >= 1);

    let stats = manager.stats();
    assert!(stats.losses >= 1);
    assert!(stats.last_loss.is_some());

    source.set_reads_failing(false);
    states_until(&mut rx, ConnectionState::Connected).await;
    assert!(manager.current_frame().is_some());
    assert!(manager.stats().connects >= 2);

    manager.stop().await;
}

#[tokio::test]
async fn test_failed_reads_lose_connection_within_loss_timeout() {
    let bus = EventBus::new(256);
    let mut rx = bus.subscribe();
    let source = MockSource::test_pattern(8, 8);
    let config = ConnectionConfig {
        loss_timeout_ms: 200,
        // far longer than the loss window
        read_retry_delay_ms: 1500,
        reconnect_delay_ms: 5000,
        ..fast_config()
    };
    let manager = manager(&source, config, &bus);

    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;
    assert!(manager.current_frame().is_some());

    source.set_reads_failing(true);
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_ne!(manager.state(), ConnectionState::Connected);
    assert!(manager.current_frame().is_none());

    let stats = manager.stats();
    assert_eq!(stats.losses, 1);
    assert!(stats.last_loss.is_some());

    manager.stop().await;
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let source = MockSource::test_pattern(8, 8);
    let manager = manager(&source, fast_config(), &bus);

    manager.start().await;
    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(source.opens(), 1);
    manager.stop().await;

    // a stopped manager can be started again
    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;
    assert_eq!(source.opens(), 2);
    manager.stop().await;
    assert_eq!(source.closes(), 2);
}

#[tokio::test]
async fn test_frame_sink_sees_probe_frames() {
    let source = MockSource::test_pattern(8, 8);
    let seen = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&seen);

    let manager = ConnectionManager::builder()
        .feed_id(3)
        .address("mock://camera-3")
        .config(fast_config())
        .source(Arc::new(source.clone()))
        .frame_sink(Arc::new(move |_: &Frame| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build()
        .unwrap();

    manager.start().await;
    timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    manager.stop().await;

    let stats = manager.stats();
    assert!(stats.frames_probed >= 3);
    assert!(stats.last_frame_time.is_some());
}

#[tokio::test]
async fn test_serving_loop_keeps_frame_fresh() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let source = MockSource::test_pattern(8, 8);
    let config = ConnectionConfig {
        probe_interval_ms: 2_000,
        loss_timeout_ms: 5_000,
        ..fast_config()
    };
    let manager = manager(&source, config, &bus);

    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;

    timeout(Duration::from_secs(2), async {
        while manager.stats().frames_served < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // probe loop is asleep, so newer frames came from direct serving reads
    let first = manager.current_frame().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = manager.current_frame().unwrap();
    assert!(later.id > first.id);

    manager.stop().await;
}

#[tokio::test]
async fn test_reset_counters() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let source = MockSource::builder()
        .fail_opens(1)
        .then_test_pattern(8, 8)
        .build();
    let manager = manager(&source, fast_config(), &bus);

    manager.start().await;
    states_until(&mut rx, ConnectionState::Connected).await;
    manager.stop().await;

    assert_eq!(manager.connection_errors(), 1);
    manager.reset_counters();
    let stats = manager.stats();
    assert_eq!(stats.connection_errors, 0);
    assert_eq!(stats.frames_probed, 0);
    assert_eq!(stats.losses, 0);
}
