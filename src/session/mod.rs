//! Per-feed composition of connection supervision and frame analysis, and
//! the registry that owns all sessions of a process.

mod registry;
mod stream;

#[cfg(test)]
mod tests;

pub use registry::SessionRegistry;
pub use stream::{
    AlertRecord, AlertSink, SessionStats, SessionStatus, StreamSession, StreamSessionBuilder,
};
