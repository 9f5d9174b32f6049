use super::slot::FrameSlot;
use super::state::ConnectionState;
use crate::config::ConnectionConfig;
use crate::error::{FeedwatchError, MediaError, Result};
use crate::events::{EventBus, FeedEvent};
use crate::frame::Frame;
use crate::media::{MediaHandle, MediaSource};
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Receives every frame acquired by the probe loop, synchronously and in order
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &Frame) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: Fn(&Frame) -> Result<()> + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) -> Result<()> {
        self(frame)
    }
}

/// Told about every open, read and decode failure
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, message: &str);
}

impl<F> ErrorSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_error(&self, message: &str) {
        self(message)
    }
}

/// Point-in-time view of a manager's counters
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub frames_probed: u64,
    pub frames_served: u64,
    pub connection_errors: u64,
    /// Consecutive failed direct reads in the serving loop. Informational:
    /// display consumers may give up on a stream, the manager never does.
    pub serving_errors: u64,
    pub connects: u64,
    /// Times the feed went silent for longer than the loss timeout
    pub losses: u64,
    pub fps: f64,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_loss: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    frames_probed: AtomicU64,
    frames_served: AtomicU64,
    connection_errors: AtomicU64,
    serving_errors: AtomicU64,
    connects: AtomicU64,
    losses: AtomicU64,
}

struct Timing {
    /// Last frame from the probe loop; drives loss detection
    last_probe_at: Option<Instant>,
    /// Last frame from either loop
    last_frame_time: Option<SystemTime>,
    connected_since: Option<SystemTime>,
    last_loss: Option<SystemTime>,
    fps_window_start: Instant,
    fps_window_frames: u64,
    fps: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            last_probe_at: None,
            last_frame_time: None,
            connected_since: None,
            last_loss: None,
            fps_window_start: Instant::now(),
            fps_window_frames: 0,
            fps: 0.0,
        }
    }
}

struct ManagerInner {
    feed_id: u32,
    address: String,
    config: ConnectionConfig,
    source: Arc<dyn MediaSource>,
    frame_sink: Option<Arc<dyn FrameSink>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    event_bus: Option<EventBus>,
    state: RwLock<ConnectionState>,
    handle: tokio::sync::Mutex<Option<Box<dyn MediaHandle>>>,
    slot: FrameSlot,
    queue: ArrayQueue<Frame>,
    counters: Counters,
    timing: Mutex<Timing>,
}

#[derive(Default)]
struct Control {
    token: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Supervises the connection to one feed
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    control: tokio::sync::Mutex<Control>,
    running: AtomicBool,
}

impl ConnectionManager {
    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::default()
    }

    pub fn feed_id(&self) -> u32 {
        self.inner.feed_id
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the probe and serving loops. Calling it while running is a no-op.
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if control.token.is_some() {
            debug!("Connection manager for feed {} already running", self.inner.feed_id);
            return;
        }

        info!(
            "Starting connection manager for feed {} ({}) using {} source",
            self.inner.feed_id,
            self.inner.address,
            self.inner.source.name()
        );

        let token = CancellationToken::new();
        let probe = tokio::spawn(probe_loop(Arc::clone(&self.inner), token.clone()));
        let serving = tokio::spawn(serving_loop(Arc::clone(&self.inner), token.clone()));

        control.token = Some(token);
        control.tasks = vec![probe, serving];
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop both loops and release the media handle.
    ///
    /// Waits at most `join_timeout` for the loops to notice cancellation, then
    /// aborts them. The handle is closed on every path, and only once.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;

        if let Some(token) = control.token.take() {
            info!("Stopping connection manager for feed {}", self.inner.feed_id);
            token.cancel();
        }
        self.running.store(false, Ordering::SeqCst);

        let mut tasks = std::mem::take(&mut control.tasks);
        if !tasks.is_empty() {
            let join_timeout = self.inner.config.join_timeout();
            if timeout(join_timeout, join_all(tasks.iter_mut())).await.is_err() {
                warn!(
                    "Feed {} loops did not exit within {:?}, aborting",
                    self.inner.feed_id, join_timeout
                );
                for task in &tasks {
                    task.abort();
                }
                let _ = join_all(tasks).await;
            }
        }

        if let Some(mut handle) = self.inner.handle.lock().await.take() {
            handle.close().await;
            debug!("Media handle for feed {} released", self.inner.feed_id);
        }

        self.inner.slot.clear();
        while self.inner.queue.pop().is_some() {}
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Newest frame, or `None` unless the feed is connected and the probe
    /// loop has delivered a frame within the loss timeout
    pub fn current_frame(&self) -> Option<Frame> {
        if self.state().is_connected() && !self.inner.loss_detected() {
            self.inner.slot.snapshot()
        } else {
            None
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let counters = &self.inner.counters;
        let timing = self.inner.timing.lock();

        ConnectionStats {
            state: self.state(),
            frames_probed: counters.frames_probed.load(Ordering::Relaxed),
            frames_served: counters.frames_served.load(Ordering::Relaxed),
            connection_errors: counters.connection_errors.load(Ordering::Relaxed),
            serving_errors: counters.serving_errors.load(Ordering::Relaxed),
            connects: counters.connects.load(Ordering::Relaxed),
            losses: counters.losses.load(Ordering::Relaxed),
            fps: timing.fps,
            last_frame_time: timing.last_frame_time.map(DateTime::<Utc>::from),
            connected_since: timing.connected_since.map(DateTime::<Utc>::from),
            last_loss: timing.last_loss.map(DateTime::<Utc>::from),
        }
    }

    pub fn connection_errors(&self) -> u64 {
        self.inner.counters.connection_errors.load(Ordering::Relaxed)
    }

    /// Zero the error and frame counters; state and timing are kept
    pub fn reset_counters(&self) {
        let counters = &self.inner.counters;
        counters.frames_probed.store(0, Ordering::Relaxed);
        counters.frames_served.store(0, Ordering::Relaxed);
        counters.connection_errors.store(0, Ordering::Relaxed);
        counters.serving_errors.store(0, Ordering::Relaxed);
        counters.connects.store(0, Ordering::Relaxed);
        counters.losses.store(0, Ordering::Relaxed);
    }
}

impl ManagerInner {
    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            *state = to;
            from
        };

        if from == to {
            return;
        }

        trace!("Feed {} state {} -> {}", self.feed_id, from, to);
        match &self.event_bus {
            Some(bus) => {
                let _ = bus.publish(FeedEvent::StateChanged {
                    feed_id: self.feed_id,
                    from,
                    to,
                    timestamp: SystemTime::now(),
                });
            }
            None => debug!("Feed {} state {} -> {}", self.feed_id, from, to),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn record_error(&self, error: &MediaError) {
        let total = self.counters.connection_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Feed {} {} error ({} total): {}",
            self.feed_id,
            error.kind(),
            total,
            error
        );

        let message = format!("Camera {}: {}", self.feed_id, error);
        if let Some(sink) = &self.error_sink {
            sink.on_error(&message);
        }
        if let Some(bus) = &self.event_bus {
            let _ = bus.publish(FeedEvent::ConnectionError {
                feed_id: self.feed_id,
                kind: error.kind(),
                message,
                timestamp: SystemTime::now(),
            });
        }
    }

    /// Open the source and read one frame. Leaves the state Connected on
    /// success and Disconnected on failure.
    async fn connect(&self) -> bool {
        self.set_state(ConnectionState::Connecting);

        let mut guard = self.handle.lock().await;
        if let Some(mut stale) = guard.take() {
            stale.close().await;
        }

        let open_timeout = self.config.open_timeout();
        let opened = match timeout(open_timeout, self.source.open(&self.address)).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::Timeout {
                waited: open_timeout,
            }),
        };

        let handle = match opened {
            Ok(handle) => guard.insert(handle),
            Err(e) => {
                drop(guard);
                self.record_error(&e);
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        };

        let read_timeout = self.config.read_timeout();
        let first = match timeout(read_timeout, handle.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::Timeout {
                waited: read_timeout,
            }),
        };

        match first {
            Ok(frame) => {
                drop(guard);
                {
                    let mut timing = self.timing.lock();
                    timing.connected_since = Some(SystemTime::now());
                    timing.fps_window_start = Instant::now();
                    timing.fps_window_frames = 0;
                }
                self.counters.connects.fetch_add(1, Ordering::Relaxed);
                self.store_probe_frame(&frame);
                self.set_state(ConnectionState::Connected);
                self.deliver(&frame);
                true
            }
            Err(e) => {
                if let Some(mut handle) = guard.take() {
                    handle.close().await;
                }
                drop(guard);
                self.record_error(&e);
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    fn store_probe_frame(&self, frame: &Frame) {
        self.slot.store(frame.clone());
        self.queue.force_push(frame.clone());

        let probed = self.counters.frames_probed.fetch_add(1, Ordering::Relaxed) + 1;
        let mut timing = self.timing.lock();
        timing.last_probe_at = Some(Instant::now());
        timing.last_frame_time = Some(frame.timestamp);

        timing.fps_window_frames += 1;
        if timing.fps_window_frames >= self.config.fps_window_frames {
            let elapsed = timing.fps_window_start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                timing.fps = timing.fps_window_frames as f64 / elapsed;
            }
            timing.fps_window_start = Instant::now();
            timing.fps_window_frames = 0;
            debug!("Feed {} probing at {:.1} fps ({} frames)", self.feed_id, timing.fps, probed);
        }
    }

    fn deliver(&self, frame: &Frame) {
        if let Some(sink) = &self.frame_sink {
            if let Err(e) = sink.on_frame(frame) {
                error!("Frame sink failed on feed {} frame {}: {}", self.feed_id, frame.id, e);
            }
        }
    }

    /// Time left before the last probe frame is older than the loss timeout
    fn until_loss(&self) -> Duration {
        let timing = self.timing.lock();
        match timing.last_probe_at {
            Some(at) => self.config.loss_timeout().saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn loss_detected(&self) -> bool {
        self.until_loss().is_zero()
    }

    async fn mark_lost(&self) {
        warn!(
            "Feed {}: no frame for more than {:?}, connection lost",
            self.feed_id,
            self.config.loss_timeout()
        );
        self.counters.losses.fetch_add(1, Ordering::Relaxed);
        self.timing.lock().last_loss = Some(SystemTime::now());
        self.set_state(ConnectionState::Lost);
        if let Some(mut handle) = self.handle.lock().await.take() {
            handle.close().await;
        }
        self.slot.clear();
        while self.queue.pop().is_some() {}
    }

    /// Read one frame from the open handle, `None` if there is no handle.
    /// The read never outlasts the loss window.
    async fn read_from_handle(&self) -> Option<std::result::Result<Frame, MediaError>> {
        let mut guard = self.handle.lock().await;
        let handle = guard.as_mut()?;

        let read_timeout = self.config.read_timeout().min(self.until_loss());
        Some(match timeout(read_timeout, handle.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(MediaError::Timeout {
                waited: read_timeout,
            }),
        })
    }
}

/// Sleep for `duration` unless cancelled first; false means cancelled
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn probe_loop(inner: Arc<ManagerInner>, token: CancellationToken) {
    debug!("Probe loop started for feed {}", inner.feed_id);

    loop {
        if token.is_cancelled() {
            break;
        }

        if inner.state().is_connected() && inner.loss_detected() {
            inner.mark_lost().await;
        }

        if inner.state().needs_connect() {
            if !inner.connect().await {
                if !pause(&token, inner.config.reconnect_delay()).await {
                    break;
                }
                continue;
            }
        } else {
            match inner.read_from_handle().await {
                Some(Ok(frame)) => {
                    inner.store_probe_frame(&frame);
                    inner.deliver(&frame);
                }
                Some(Err(e)) => {
                    inner.record_error(&e);
                    if inner.loss_detected() {
                        inner.mark_lost().await;
                        continue;
                    }
                    // wake early if the loss window closes during the retry delay
                    let wait = inner.config.read_retry_delay().min(inner.until_loss());
                    if !pause(&token, wait).await {
                        break;
                    }
                    continue;
                }
                None => {
                    debug!("Feed {} has no open handle, reconnecting", inner.feed_id);
                    inner.set_state(ConnectionState::Disconnected);
                    continue;
                }
            }
        }

        if !pause(&token, inner.config.probe_interval()).await {
            break;
        }
    }

    debug!("Probe loop stopped for feed {}", inner.feed_id);
}

async fn serving_loop(inner: Arc<ManagerInner>, token: CancellationToken) {
    debug!("Serving loop started for feed {}", inner.feed_id);

    loop {
        if token.is_cancelled() {
            break;
        }

        if !inner.state().is_connected() {
            if !pause(&token, inner.config.serving_idle_delay()).await {
                break;
            }
            continue;
        }

        let mut newest = None;
        while let Some(frame) = inner.queue.pop() {
            newest = Some(frame);
        }

        if newest.is_none() && inner.config.serving_direct_reads {
            // only read when the probe loop is not holding the handle
            if let Ok(mut guard) = inner.handle.try_lock() {
                if let Some(handle) = guard.as_mut() {
                    let read_timeout = inner.config.read_timeout();
                    match timeout(read_timeout, handle.read_frame()).await {
                        Ok(Ok(frame)) => newest = Some(frame),
                        Ok(Err(e)) => {
                            let errors = inner.counters.serving_errors.fetch_add(1, Ordering::Relaxed) + 1;
                            trace!("Feed {} serving read failed ({} in a row): {}", inner.feed_id, errors, e);
                        }
                        Err(_) => {
                            inner.counters.serving_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        if let Some(frame) = newest {
            if inner.state().is_connected() {
                inner.counters.frames_served.fetch_add(1, Ordering::Relaxed);
                inner.counters.serving_errors.store(0, Ordering::Relaxed);
                inner.timing.lock().last_frame_time = Some(frame.timestamp);
                inner.slot.store(frame);
            }
        }

        if !pause(&token, inner.config.serving_interval()).await {
            break;
        }
    }

    debug!("Serving loop stopped for feed {}", inner.feed_id);
}

/// Builder for [`ConnectionManager`]
#[derive(Default)]
pub struct ConnectionManagerBuilder {
    feed_id: u32,
    address: Option<String>,
    config: Option<ConnectionConfig>,
    source: Option<Arc<dyn MediaSource>>,
    frame_sink: Option<Arc<dyn FrameSink>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    event_bus: Option<EventBus>,
}

impl ConnectionManagerBuilder {
    pub fn feed_id(mut self, feed_id: u32) -> Self {
        self.feed_id = feed_id;
        self
    }

    pub fn address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn frame_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.frame_sink = Some(sink);
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

    pub fn build(self) -> Result<ConnectionManager> {
        let address = self.address.ok_or_else(|| {
            FeedwatchError::component("connection_manager", "Stream address is required")
        })?;
        let source = self.source.ok_or_else(|| {
            FeedwatchError::component("connection_manager", "Media source is required")
        })?;
        let config = self.config.unwrap_or_default();

        Ok(ConnectionManager {
            inner: Arc::new(ManagerInner {
                feed_id: self.feed_id,
                address,
                queue: ArrayQueue::new(config.frame_queue_capacity.max(1)),
                config,
                source,
                frame_sink: self.frame_sink,
                error_sink: self.error_sink,
                event_bus: self.event_bus,
                state: RwLock::new(ConnectionState::Disconnected),
                handle: tokio::sync::Mutex::new(None),
                slot: FrameSlot::new(),
                counters: Counters::default(),
                timing: Mutex::new(Timing::default()),
            }),
            control: tokio::sync::Mutex::new(Control::default()),
            running: AtomicBool::new(false),
        })
    }
}
