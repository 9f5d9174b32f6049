use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedwatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl FeedwatchError {
    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Failures reported by a media source. All of them are recovered by the
/// connection manager; none is fatal to a running session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Failed to connect to {address}: {details}")]
    Connection { address: String, details: String },

    #[error("Frame decode failed: {details}")]
    Decode { details: String },

    #[error("No frame received within {waited:?}")]
    Timeout { waited: Duration },
}

impl MediaError {
    pub fn connection<A: Into<String>, D: Into<String>>(address: A, details: D) -> Self {
        Self::Connection {
            address: address.into(),
            details: details.into(),
        }
    }

    pub fn decode<D: Into<String>>(details: D) -> Self {
        Self::Decode {
            details: details.into(),
        }
    }

    /// Short machine-friendly kind, used in events and logs
    pub fn kind(&self) -> &'static str {
        match self {
            MediaError::Connection { .. } => "connection",
            MediaError::Decode { .. } => "decode",
            MediaError::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Frame processing failed: {details}")]
    FrameProcessing { details: String },
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Feed {0} is already registered")]
    DuplicateFeed(u32),

    #[error("Feed {0} not found")]
    UnknownFeed(u32),
}

pub type Result<T> = std::result::Result<T, FeedwatchError>;
