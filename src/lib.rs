pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod frame;
pub mod media;
pub mod session;

pub use config::{ConnectionConfig, DiagnosticsConfig, FeedConfig, FeedwatchConfig, SystemConfig};
pub use connection::{
    ConnectionManager, ConnectionManagerBuilder, ConnectionState, ConnectionStats, ErrorSink,
    FrameSink, FrameSlot,
};
pub use diagnostics::{
    AlertKind, AlertSet, FrameAnalysis, FrameDelta, FrameHealthAnalyzer, FrameMetrics,
    QualitySample, QualityTier,
};
pub use error::{FeedwatchError, MediaError, Result};
pub use events::{EventBus, EventFilter, EventReceiver, FeedEvent};
pub use frame::{Frame, FrameFormat};
pub use media::{MediaHandle, MediaSource, MockSource, MockSourceBuilder};
pub use session::{
    AlertRecord, AlertSink, SessionRegistry, SessionStats, SessionStatus, StreamSession,
    StreamSessionBuilder,
};

#[cfg(all(target_os = "linux", feature = "gstreamer"))]
pub use media::GstMediaSource;
