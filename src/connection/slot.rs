use crate::frame::Frame;
use parking_lot::Mutex;

/// Holds the most recently acquired frame of a feed.
///
/// Both acquisition loops write here; the last writer wins. Readers get an
/// owned `Frame` whose pixel buffer is immutable, so a snapshot can never be
/// torn by a later write.
#[derive(Default)]
pub struct FrameSlot {
    current: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Frame) {
        *self.current.lock() = Some(frame);
    }

    pub fn snapshot(&self) -> Option<Frame> {
        self.current.lock().clone()
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    pub fn is_empty(&self) -> bool {
        self.current.lock().is_none()
    }
}
