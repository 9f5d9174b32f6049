use super::metrics::{FrameDelta, FrameMetrics};
use crate::config::DiagnosticsConfig;
use crate::error::Result;
use crate::frame::Frame;
use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Kinds of picture problems the analyzer reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// Static by both magnitude and variance of the frame difference
    Frozen,
    /// Static by magnitude alone over a longer run
    Stopped,
    /// Visually degraded picture
    Pixelated,
}

impl AlertKind {
    pub const ALL: [AlertKind; 3] = [AlertKind::Frozen, AlertKind::Stopped, AlertKind::Pixelated];

    fn bit(self) -> u8 {
        match self {
            AlertKind::Frozen => 1,
            AlertKind::Stopped => 1 << 1,
            AlertKind::Pixelated => 1 << 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Frozen => "frozen",
            AlertKind::Stopped => "stopped",
            AlertKind::Pixelated => "pixelated",
        }
    }

    /// Phrase used in alert messages
    pub fn description(&self) -> &'static str {
        match self {
            AlertKind::Frozen => "image frozen",
            AlertKind::Stopped => "video stopped",
            AlertKind::Pixelated => "image pixelated",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small set of [`AlertKind`]s, possibly empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertSet(u8);

impl AlertSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kinds(kinds: &[AlertKind]) -> Self {
        let mut set = Self::new();
        for kind in kinds {
            set.insert(*kind);
        }
        set
    }

    pub fn insert(&mut self, kind: AlertKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(&self, kind: AlertKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = AlertKind> + '_ {
        AlertKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl fmt::Display for AlertSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|kind| kind.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}

impl Serialize for AlertSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for kind in self.iter() {
            seq.serialize_element(&kind)?;
        }
        seq.end()
    }
}

/// How much scrutiny the current connection quality calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Only the freeze check runs
    Good,
    /// Freeze, stop and pixelation checks all run
    Degraded,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualitySample {
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of analysing one frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameAnalysis {
    pub metrics: FrameMetrics,
    /// `None` for the first frame and after a size change
    pub delta: Option<FrameDelta>,
    pub quality_score: f64,
    pub tier: QualityTier,
    pub freeze_count: u32,
    pub no_motion_count: u32,
    pub alerts: AlertSet,
}

/// Stateful per-feed analyzer turning frames into health signals.
///
/// Only ever driven from one probe loop, so it needs no internal locking.
pub struct FrameHealthAnalyzer {
    config: DiagnosticsConfig,
    previous: Option<GrayImage>,
    freeze_count: u32,
    no_motion_count: u32,
    history: VecDeque<QualitySample>,
    frames_analyzed: u64,
    last_tier: QualityTier,
}

impl FrameHealthAnalyzer {
    pub fn new(config: DiagnosticsConfig) -> Self {
        let capacity = config.quality_window * 2;
        Self {
            config,
            previous: None,
            freeze_count: 0,
            no_motion_count: 0,
            history: VecDeque::with_capacity(capacity),
            frames_analyzed: 0,
            last_tier: QualityTier::Good,
        }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    pub fn analyze(&mut self, frame: &Frame) -> Result<FrameAnalysis> {
        let luma = frame.to_luma()?;
        Ok(self.analyze_luma(luma))
    }

    pub fn analyze_luma(&mut self, luma: GrayImage) -> FrameAnalysis {
        self.frames_analyzed += 1;

        let delta = self
            .previous
            .as_ref()
            .and_then(|previous| FrameDelta::between(previous, &luma));
        self.update_counters(delta.as_ref());

        let metrics = FrameMetrics::compute(&luma, &self.config);
        let quality_score = metrics.quality_score();
        self.record_quality_sample(quality_score);
        let tier = self.tier();
        self.note_tier(tier);

        let mut alerts = AlertSet::new();
        if self.freeze_count >= self.config.freeze_frames {
            alerts.insert(AlertKind::Frozen);
        }
        if tier == QualityTier::Degraded {
            if self.no_motion_count >= self.config.no_motion_frames {
                alerts.insert(AlertKind::Stopped);
            }
            if metrics.is_pixelated(&self.config) {
                alerts.insert(AlertKind::Pixelated);
            }
        }

        trace!(
            "Frame analysed: score {:.3}, contrast {:.1}, sharpness {:.1}, edges {:.4}, blocks {:.2}, freeze {}, still {}",
            quality_score,
            metrics.contrast,
            metrics.sharpness,
            metrics.edge_density,
            metrics.block_ratio,
            self.freeze_count,
            self.no_motion_count
        );

        self.previous = Some(luma);

        FrameAnalysis {
            metrics,
            delta,
            quality_score,
            tier,
            freeze_count: self.freeze_count,
            no_motion_count: self.no_motion_count,
            alerts,
        }
    }

    fn update_counters(&mut self, delta: Option<&FrameDelta>) {
        let Some(delta) = delta else {
            // first frame or a resolution change counts as motion
            self.freeze_count = 0;
            self.no_motion_count = 0;
            return;
        };

        let is_static =
            delta.sum < self.config.freeze_threshold && delta.std < self.config.motion_threshold;
        if is_static {
            self.freeze_count += 1;
        } else {
            self.freeze_count = 0;
        }

        if delta.sum < self.config.motion_threshold {
            self.no_motion_count += 1;
        } else {
            self.no_motion_count = 0;
        }
    }

    fn note_tier(&mut self, tier: QualityTier) {
        if tier != self.last_tier {
            match tier {
                QualityTier::Degraded => warn!(
                    "Connection quality degraded (recent mean {:.2}), running full checks",
                    self.recent_mean(self.config.quality_window).unwrap_or(0.0)
                ),
                QualityTier::Good => info!("Connection quality recovered"),
            }
            self.last_tier = tier;
        }
    }

    /// Append a quality sample, evicting the oldest beyond twice the window
    pub fn record_quality_sample(&mut self, score: f64) {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.history.push_back(QualitySample {
            score,
            timestamp: Utc::now(),
        });
        let capacity = self.config.quality_window * 2;
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    fn recent_mean(&self, count: usize) -> Option<f64> {
        if count == 0 || self.history.is_empty() {
            return None;
        }
        let recent: Vec<f64> = self.history.iter().rev().take(count).map(|s| s.score).collect();
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    /// Good until a full window of samples says otherwise
    pub fn tier(&self) -> QualityTier {
        let window = self.config.quality_window;
        if self.history.len() < window {
            return QualityTier::Good;
        }

        match self.recent_mean(window) {
            Some(mean) if mean < self.config.quality_good_threshold => QualityTier::Degraded,
            _ => QualityTier::Good,
        }
    }

    pub fn is_quality_good(&self) -> bool {
        self.tier() == QualityTier::Good
    }

    /// Mean of the most recent samples, the figure reported in status
    pub fn connection_quality(&self) -> f64 {
        match self.recent_mean(self.config.recent_quality_samples) {
            Some(mean) => mean,
            None if self.frames_analyzed > 0 => 0.8,
            None => 0.0,
        }
    }

    /// Drop the quality history but keep counters and the reference frame
    pub fn clear_quality_history(&mut self) {
        self.history.clear();
    }

    pub fn quality_history(&self) -> impl Iterator<Item = &QualitySample> {
        self.history.iter()
    }

    pub fn frames_analyzed(&self) -> u64 {
        self.frames_analyzed
    }

    pub fn freeze_count(&self) -> u32 {
        self.freeze_count
    }

    pub fn no_motion_count(&self) -> u32 {
        self.no_motion_count
    }

    /// Forget history, counters and the reference frame
    pub fn reset(&mut self) {
        debug!("Resetting frame health analyzer");
        self.previous = None;
        self.freeze_count = 0;
        self.no_motion_count = 0;
        self.history.clear();
        self.frames_analyzed = 0;
        self.last_tier = QualityTier::Good;
    }
}
