//! Keeps one feed connected and its newest frame available.
//!
//! A low-rate probe loop drives the state machine and forwards every frame
//! to the analyzer; a higher-rate serving loop only keeps the current frame
//! fresh for display consumers.

mod manager;
mod slot;
mod state;

#[cfg(test)]
mod tests;

pub use manager::{ConnectionManager, ConnectionManagerBuilder, ConnectionStats, ErrorSink, FrameSink};
pub use slot::FrameSlot;
pub use state::ConnectionState;
