//! Frame health analysis: picture metrics, freeze and stall counters, a
//! rolling quality history and the tiered alert policy built on them.

mod analyzer;
mod metrics;


pub use analyzer::{
    AlertKind, AlertSet, FrameAnalysis, FrameHealthAnalyzer, QualitySample, QualityTier,
};
pub use metrics::{FrameDelta, FrameMetrics};
