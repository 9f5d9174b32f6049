//! Contract between the connection manager and whatever actually decodes the
//! stream. The core never touches transport or codecs; it only opens a
//! handle, pulls frames from it and closes it.

#[cfg(all(target_os = "linux", feature = "gstreamer"))]
mod gst;
mod mock;

#[cfg(all(target_os = "linux", feature = "gstreamer"))]
pub use gst::GstMediaSource;
pub use mock::{MockSource, MockSourceBuilder};

use crate::error::MediaError;
use crate::frame::Frame;
use async_trait::async_trait;

/// Opens stream endpoints. One source may serve many feeds; every open
/// returns an independent handle.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, address: &str) -> Result<Box<dyn MediaHandle>, MediaError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "media"
    }
}

/// An open stream. Owned exclusively by one connection manager.
#[async_trait]
pub trait MediaHandle: Send {
    /// Pull the next decoded frame. Implementations may block for a while;
    /// the caller bounds every read with its own timeout.
    async fn read_frame(&mut self) -> Result<Frame, MediaError>;

    /// Release the underlying stream. Called exactly once per handle.
    async fn close(&mut self);
}
