use crate::config::{ConnectionConfig, DiagnosticsConfig, FeedConfig};
use crate::connection::{ConnectionManager, ConnectionState, ErrorSink, FrameSink};
use crate::diagnostics::{AlertKind, AlertSet, FrameHealthAnalyzer};
use crate::error::{FeedwatchError, Result};
use crate::events::{EventBus, FeedEvent};
use crate::frame::Frame;
use crate::media::MediaSource;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DEFAULT_EVENT_BUS_CAPACITY: usize = 100;

/// The most recent alert raised by a session
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub kinds: AlertSet,
    pub message: String,
}

/// Receives every non-empty alert set, synchronously from the probe loop
pub trait AlertSink: Send + Sync {
    fn on_alert(&self, feed_id: u32, alert: &AlertRecord);
}

impl<F> AlertSink for F
where
    F: Fn(u32, &AlertRecord) + Send + Sync,
{
    fn on_alert(&self, feed_id: u32, alert: &AlertRecord) {
        self(feed_id, alert)
    }
}

/// Accumulated counters of one session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total_frames: u64,
    pub frozen_frames: u64,
    pub stopped_frames: u64,
    pub low_quality_frames: u64,
    pub connection_errors: u64,
    pub last_alert: Option<AlertRecord>,
}

/// Snapshot returned by [`StreamSession::status`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: u32,
    pub name: String,
    pub address: String,
    pub running: bool,
    pub state: ConnectionState,
    pub connected: bool,
    pub quality_score: f64,
    pub quality_good: bool,
    pub fps: f64,
    pub frames_served: u64,
    pub last_frame_time: Option<DateTime<Utc>>,
    /// When the feed last went silent past the loss timeout
    pub last_loss: Option<DateTime<Utc>>,
    pub stats: SessionStats,
}

/// Analyzer plus counters, fed by the probe loop
struct FeedMonitor {
    feed_id: u32,
    name: String,
    analyzer: Mutex<FrameHealthAnalyzer>,
    stats: Mutex<SessionStats>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    event_bus: EventBus,
}

impl FeedMonitor {
    fn raise(&self, kinds: AlertSet) {
        let descriptions: Vec<&str> = kinds.iter().map(|kind| kind.description()).collect();
        let record = AlertRecord {
            timestamp: Utc::now(),
            kinds,
            message: format!(
                "Camera {} ({}): {}",
                self.feed_id,
                self.name,
                descriptions.join("; ")
            ),
        };

        {
            let mut stats = self.stats.lock();
            if kinds.contains(AlertKind::Frozen) {
                stats.frozen_frames += 1;
            }
            if kinds.contains(AlertKind::Stopped) {
                stats.stopped_frames += 1;
            }
            if kinds.contains(AlertKind::Pixelated) {
                stats.low_quality_frames += 1;
            }
            stats.last_alert = Some(record.clone());
        }

        warn!("{}", record.message);

        if let Some(sink) = &self.alert_sink {
            sink.on_alert(self.feed_id, &record);
        }

        let _ = self.event_bus.publish(FeedEvent::AlertRaised {
            feed_id: self.feed_id,
            kinds,
            message: record.message,
            timestamp: SystemTime::now(),
        });
    }
}

impl FrameSink for FeedMonitor {
    fn on_frame(&self, frame: &Frame) -> Result<()> {
        let analysis = self.analyzer.lock().analyze(frame)?;
        self.stats.lock().total_frames += 1;

        if !analysis.alerts.is_empty() {
            self.raise(analysis.alerts);
        }
        Ok(())
    }
}

/// One monitored feed: a connection manager wired to a frame health analyzer
pub struct StreamSession {
    id: u32,
    name: String,
    address: String,
    restart_delay: std::time::Duration,
    quality_window: usize,
    manager: ConnectionManager,
    monitor: Arc<FeedMonitor>,
}

impl StreamSession {
    pub fn builder() -> StreamSessionBuilder {
        StreamSessionBuilder::default()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Start acquisition and analysis; no-op while already running
    pub async fn start(&self) {
        info!("Starting session for camera {} ({})", self.id, self.name);
        self.manager.start().await;
    }

    /// Stop both loops and release the stream; safe to call repeatedly
    pub async fn stop(&self) {
        self.manager.stop().await;
        info!("Session for camera {} stopped", self.id);
    }

    pub async fn restart(&self) {
        info!("Restarting session for camera {}", self.id);
        self.stop().await;
        tokio::time::sleep(self.restart_delay).await;
        self.start().await;
    }

    /// Newest frame, or `None` unless connected
    pub fn current_frame(&self) -> Option<Frame> {
        self.manager.current_frame()
    }

    pub fn status(&self) -> SessionStatus {
        let connection = self.manager.stats();
        let (quality_score, quality_good) = {
            let analyzer = self.monitor.analyzer.lock();
            (analyzer.connection_quality(), analyzer.is_quality_good())
        };

        let mut stats = self.monitor.stats.lock().clone();
        stats.connection_errors = connection.connection_errors;

        SessionStatus {
            id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            running: self.manager.is_running(),
            state: connection.state,
            connected: connection.state.is_connected(),
            quality_score,
            quality_good,
            fps: connection.fps,
            frames_served: connection.frames_served,
            last_frame_time: connection.last_frame_time,
            last_loss: connection.last_loss,
            stats,
        }
    }

    /// Clear counters, the last alert, the analyzer state and connection errors
    pub fn reset_stats(&self) {
        *self.monitor.stats.lock() = SessionStats::default();
        self.monitor.analyzer.lock().reset();
        self.manager.reset_counters();
        info!("Statistics reset for camera {}", self.id);
    }

    /// Push one alert of each kind through the regular alert path
    pub fn inject_test_alerts(&self) {
        info!("Injecting test alerts for camera {}", self.id);
        for kind in [AlertKind::Stopped, AlertKind::Pixelated, AlertKind::Frozen] {
            self.monitor.raise(AlertSet::from_kinds(&[kind]));
        }
    }

    /// Fill the quality window with poor samples so full checks engage
    pub fn simulate_poor_connection(&self) {
        let mut analyzer = self.monitor.analyzer.lock();
        for _ in 0..self.quality_window {
            analyzer.record_quality_sample(0.3);
        }
        warn!("Simulated poor connection on camera {}", self.id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.monitor.event_bus.subscribe()
    }
}

/// Builder for [`StreamSession`]
#[derive(Default)]
pub struct StreamSessionBuilder {
    feed: Option<FeedConfig>,
    connection: Option<ConnectionConfig>,
    diagnostics: Option<DiagnosticsConfig>,
    source: Option<Arc<dyn MediaSource>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    event_bus: Option<EventBus>,
}

impl StreamSessionBuilder {
    pub fn feed(mut self, feed: FeedConfig) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = Some(config);
        self
    }

    pub fn diagnostics(mut self, config: DiagnosticsConfig) -> Self {
        self.diagnostics = Some(config);
        self
    }

    pub fn source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Result<StreamSession> {
        let feed = self
            .feed
            .ok_or_else(|| FeedwatchError::component("stream_session", "Feed is required"))?;
        let source = self
            .source
            .ok_or_else(|| FeedwatchError::component("stream_session", "Media source is required"))?;
        let connection = self.connection.unwrap_or_default();
        let diagnostics = self.diagnostics.unwrap_or_default();
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(DEFAULT_EVENT_BUS_CAPACITY));

        debug!("Building session for camera {} at {}", feed.id, feed.url);

        let quality_window = diagnostics.quality_window;
        let monitor = Arc::new(FeedMonitor {
            feed_id: feed.id,
            name: feed.name.clone(),
            analyzer: Mutex::new(FrameHealthAnalyzer::new(diagnostics)),
            stats: Mutex::new(SessionStats::default()),
            alert_sink: self.alert_sink,
            event_bus: event_bus.clone(),
        });

        let mut manager = ConnectionManager::builder()
            .feed_id(feed.id)
            .address(feed.url.clone())
            .config(connection.clone())
            .source(source)
            .frame_sink(Arc::clone(&monitor) as Arc<dyn FrameSink>)
            .event_bus(event_bus);
        if let Some(error_sink) = self.error_sink {
            manager = manager.error_sink(error_sink);
        }

        Ok(StreamSession {
            id: feed.id,
            name: feed.name,
            address: feed.url,
            restart_delay: connection.restart_delay(),
            quality_window,
            manager: manager.build()?,
            monitor,
        })
    }
}
