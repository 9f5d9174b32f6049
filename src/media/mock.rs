use super::{MediaHandle, MediaSource};
use crate::error::MediaError;
use crate::frame::{Frame, FrameFormat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// What a mock handle yields once its scripted frames are used up
#[derive(Debug, Clone, Copy)]
enum Exhausted {
    RepeatLast,
    TestPattern { width: u32, height: u32 },
    Fail,
}

struct MockState {
    open_failures_left: AtomicU32,
    reads_failing: AtomicBool,
    script: Mutex<VecDeque<Frame>>,
    last_frame: Mutex<Option<Frame>>,
    exhausted: Exhausted,
    read_delay: Duration,
    opens: AtomicU32,
    open_attempts: AtomicU32,
    closes: AtomicU32,
    frames_read: AtomicU64,
    next_id: AtomicU64,
}

/// Scriptable in-memory media source for tests and the `--synthetic` mode.
///
/// Clones share state, so a test can keep one clone to inspect counters
/// while another is owned by a session.
#[derive(Clone)]
pub struct MockSource {
    state: Arc<MockState>,
}

impl MockSource {
    pub fn builder() -> MockSourceBuilder {
        MockSourceBuilder::default()
    }

    /// Endless moving test pattern, never fails
    pub fn test_pattern(width: u32, height: u32) -> Self {
        Self::builder().then_test_pattern(width, height).build()
    }

    /// Successful opens so far
    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Every open call, including failed ones
    pub fn open_attempts(&self) -> u32 {
        self.state.open_attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn frames_read(&self) -> u64 {
        self.state.frames_read.load(Ordering::SeqCst)
    }

    /// Make every subsequent read fail (or succeed again)
    pub fn set_reads_failing(&self, failing: bool) {
        self.state.reads_failing.store(failing, Ordering::SeqCst);
    }

    /// Make the next `count` open calls fail
    pub fn fail_next_opens(&self, count: u32) {
        self.state.open_failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn open(&self, address: &str) -> Result<Box<dyn MediaHandle>, MediaError> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);

        let left = self.state.open_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.state
                .open_failures_left
                .store(left - 1, Ordering::SeqCst);
            debug!("Mock open of {} failing ({} failures left)", address, left - 1);
            return Err(MediaError::connection(address, "scripted open failure"));
        }

        self.state.opens.fetch_add(1, Ordering::SeqCst);
        debug!("Mock source opened {}", address);

        Ok(Box::new(MockHandle {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockHandle {
    state: Arc<MockState>,
    closed: bool,
}

impl MockHandle {
    fn stamp(&self, frame: &Frame) -> Frame {
        Frame {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: SystemTime::now(),
            ..frame.clone()
        }
    }

    fn pattern_frame(&self, width: u32, height: u32) -> Frame {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let bar_width = (width / 8).max(1);
        let offset = ((id * 4) % width.max(1) as u64) as u32;

        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let in_bar = (x + width - offset) % width < bar_width;
                let value = if in_bar {
                    255
                } else {
                    ((x * 160) / width.max(1) + (y * 60) / height.max(1)) as u8
                };
                data.push(value);
            }
        }

        Frame::new(id, SystemTime::now(), data, width, height, FrameFormat::Gray8)
    }
}

#[async_trait]
impl MediaHandle for MockHandle {
    async fn read_frame(&mut self) -> Result<Frame, MediaError> {
        if !self.state.read_delay.is_zero() {
            tokio::time::sleep(self.state.read_delay).await;
        }

        if self.closed {
            return Err(MediaError::decode("handle already closed"));
        }

        if self.state.reads_failing.load(Ordering::SeqCst) {
            return Err(MediaError::decode("scripted read failure"));
        }

        let scripted = self.state.script.lock().pop_front();
        let frame = match scripted {
            Some(frame) => self.stamp(&frame),
            None => match self.state.exhausted {
                Exhausted::RepeatLast => {
                    let last = self.state.last_frame.lock().clone();
                    match last {
                        Some(frame) => self.stamp(&frame),
                        None => return Err(MediaError::decode("mock source has no frames")),
                    }
                }
                Exhausted::TestPattern { width, height } => self.pattern_frame(width, height),
                Exhausted::Fail => return Err(MediaError::decode("end of stream")),
            },
        };

        *self.state.last_frame.lock() = Some(frame.clone());
        self.state.frames_read.fetch_add(1, Ordering::SeqCst);
        trace!("Mock frame {} ({}x{})", frame.id, frame.width, frame.height);

        Ok(frame)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            debug!("Mock handle closed");
        }
    }
}

/// Builder for [`MockSource`]
pub struct MockSourceBuilder {
    open_failures: u32,
    frames: Vec<Frame>,
    exhausted: Exhausted,
    read_delay: Duration,
}

impl Default for MockSourceBuilder {
    fn default() -> Self {
        Self {
            open_failures: 0,
            frames: Vec::new(),
            exhausted: Exhausted::RepeatLast,
            read_delay: Duration::ZERO,
        }
    }
}

impl MockSourceBuilder {
    /// Fail the first `count` open attempts
    pub fn fail_opens(mut self, count: u32) -> Self {
        self.open_failures = count;
        self
    }

    /// Frames returned in order before the exhaustion policy applies
    pub fn frames(mut self, frames: Vec<Frame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    /// Keep returning the last frame (a frozen picture)
    pub fn then_repeat_last(mut self) -> Self {
        self.exhausted = Exhausted::RepeatLast;
        self
    }

    pub fn then_test_pattern(mut self, width: u32, height: u32) -> Self {
        self.exhausted = Exhausted::TestPattern { width, height };
        self
    }

    /// Fail every read after the script ends
    pub fn then_fail(mut self) -> Self {
        self.exhausted = Exhausted::Fail;
        self
    }

    /// Delay applied to every read
    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn build(self) -> MockSource {
        MockSource {
            state: Arc::new(MockState {
                open_failures_left: AtomicU32::new(self.open_failures),
                reads_failing: AtomicBool::new(false),
                script: Mutex::new(self.frames.into()),
                last_frame: Mutex::new(None),
                exhausted: self.exhausted,
                read_delay: self.read_delay,
                opens: AtomicU32::new(0),
                open_attempts: AtomicU32::new(0),
                closes: AtomicU32::new(0),
                frames_read: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}
