use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FeedwatchConfig {
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

/// One monitored feed
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FeedConfig {
    pub id: u32,
    pub name: String,
    /// Stream address handed to the media source (rtsp://, http://, file://)
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionConfig {
    /// Sleep between probe loop reads
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Sleep between serving loop refreshes
    #[serde(default = "default_serving_interval_ms")]
    pub serving_interval_ms: u64,

    /// Flat delay after a failed open attempt
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Flat delay after a failed read on an open connection
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,

    /// A connected feed with no frame for this long is considered lost
    #[serde(default = "default_loss_timeout_ms")]
    pub loss_timeout_ms: u64,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Upper bound on how long stop() waits for the loops to exit
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Serving loop back-off while the feed is not connected
    #[serde(default = "default_serving_idle_delay_ms")]
    pub serving_idle_delay_ms: u64,

    /// Capacity of the probe-to-serving frame queue (oldest dropped first)
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,

    /// Let the serving loop read from the source when the queue is empty
    #[serde(default = "default_serving_direct_reads")]
    pub serving_direct_reads: bool,

    /// Pause between stop and start on restart
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Number of probed frames between FPS recomputations
    #[serde(default = "default_fps_window_frames")]
    pub fps_window_frames: u64,
}

impl ConnectionConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn serving_interval(&self) -> Duration {
        Duration::from_millis(self.serving_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn loss_timeout(&self) -> Duration {
        Duration::from_millis(self.loss_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn serving_idle_delay(&self) -> Duration {
        Duration::from_millis(self.serving_idle_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            serving_interval_ms: default_serving_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
            loss_timeout_ms: default_loss_timeout_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            serving_idle_delay_ms: default_serving_idle_delay_ms(),
            frame_queue_capacity: default_frame_queue_capacity(),
            serving_direct_reads: default_serving_direct_reads(),
            restart_delay_ms: default_restart_delay_ms(),
            fps_window_frames: default_fps_window_frames(),
        }
    }
}

/// Thresholds for the frame health analyzer
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DiagnosticsConfig {
    /// Total absolute luminance difference below which a frame may be static
    #[serde(default = "default_freeze_threshold")]
    pub freeze_threshold: f64,

    /// Consecutive static frames before "frozen" fires
    #[serde(default = "default_freeze_frames")]
    pub freeze_frames: u32,

    /// Difference std bound for "frozen", and total-difference bound for "stopped"
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f64,

    /// Consecutive motionless frames before "stopped" fires
    #[serde(default = "default_no_motion_frames")]
    pub no_motion_frames: u32,

    /// Minimum luminance standard deviation (contrast)
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Minimum Laplacian variance (sharpness)
    #[serde(default = "default_blur_threshold")]
    pub blur_threshold: f64,

    #[serde(default = "default_edge_density_threshold")]
    pub edge_density_threshold: f64,

    /// Maximum share of flat tiles before the frame counts as blocky
    #[serde(default = "default_block_ratio_threshold")]
    pub block_ratio_threshold: f64,

    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Tiles with a luminance std below this are flat
    #[serde(default = "default_block_std_threshold")]
    pub block_std_threshold: f64,

    /// Number of recent quality samples that decide the tier (K)
    #[serde(default = "default_quality_window")]
    pub quality_window: usize,

    #[serde(default = "default_quality_good_threshold")]
    pub quality_good_threshold: f64,

    #[serde(default = "default_canny_low")]
    pub canny_low: f32,

    #[serde(default = "default_canny_high")]
    pub canny_high: f32,

    /// Samples averaged for the reported quality score
    #[serde(default = "default_recent_quality_samples")]
    pub recent_quality_samples: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            freeze_threshold: default_freeze_threshold(),
            freeze_frames: default_freeze_frames(),
            motion_threshold: default_motion_threshold(),
            no_motion_frames: default_no_motion_frames(),
            quality_threshold: default_quality_threshold(),
            blur_threshold: default_blur_threshold(),
            edge_density_threshold: default_edge_density_threshold(),
            block_ratio_threshold: default_block_ratio_threshold(),
            block_size: default_block_size(),
            block_std_threshold: default_block_std_threshold(),
            quality_window: default_quality_window(),
            quality_good_threshold: default_quality_good_threshold(),
            canny_low: default_canny_low(),
            canny_high: default_canny_high(),
            recent_quality_samples: default_recent_quality_samples(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Interval between status log lines in the binary
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl FeedwatchConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("feedwatch.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("connection.probe_interval_ms", default_probe_interval_ms() as i64)?
            .set_default("connection.serving_interval_ms", default_serving_interval_ms() as i64)?
            .set_default("connection.reconnect_delay_ms", default_reconnect_delay_ms() as i64)?
            .set_default("connection.read_retry_delay_ms", default_read_retry_delay_ms() as i64)?
            .set_default("connection.loss_timeout_ms", default_loss_timeout_ms() as i64)?
            .set_default("connection.open_timeout_ms", default_open_timeout_ms() as i64)?
            .set_default("connection.read_timeout_ms", default_read_timeout_ms() as i64)?
            .set_default("connection.join_timeout_ms", default_join_timeout_ms() as i64)?
            .set_default(
                "connection.serving_idle_delay_ms",
                default_serving_idle_delay_ms() as i64,
            )?
            .set_default(
                "connection.frame_queue_capacity",
                default_frame_queue_capacity() as i64,
            )?
            .set_default(
                "connection.serving_direct_reads",
                default_serving_direct_reads(),
            )?
            .set_default("connection.restart_delay_ms", default_restart_delay_ms() as i64)?
            .set_default("connection.fps_window_frames", default_fps_window_frames() as i64)?
            .set_default("diagnostics.freeze_threshold", default_freeze_threshold())?
            .set_default("diagnostics.freeze_frames", default_freeze_frames() as i64)?
            .set_default("diagnostics.motion_threshold", default_motion_threshold())?
            .set_default("diagnostics.no_motion_frames", default_no_motion_frames() as i64)?
            .set_default("diagnostics.quality_threshold", default_quality_threshold())?
            .set_default("diagnostics.blur_threshold", default_blur_threshold())?
            .set_default(
                "diagnostics.edge_density_threshold",
                default_edge_density_threshold(),
            )?
            .set_default(
                "diagnostics.block_ratio_threshold",
                default_block_ratio_threshold(),
            )?
            .set_default("diagnostics.block_size", default_block_size() as i64)?
            .set_default(
                "diagnostics.block_std_threshold",
                default_block_std_threshold(),
            )?
            .set_default(
                "diagnostics.quality_window",
                default_quality_window() as i64,
            )?
            .set_default(
                "diagnostics.quality_good_threshold",
                default_quality_good_threshold(),
            )?
            .set_default("diagnostics.canny_low", default_canny_low() as f64)?
            .set_default("diagnostics.canny_high", default_canny_high() as f64)?
            .set_default(
                "diagnostics.recent_quality_samples",
                default_recent_quality_samples() as i64,
            )?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default("system.status_interval_secs", default_status_interval_secs() as i64)?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Environment overrides, e.g. FEEDWATCH__CONNECTION__LOSS_TIMEOUT_MS
            .add_source(Environment::with_prefix("FEEDWATCH").separator("__"))
            .build()?;

        let config: FeedwatchConfig = settings.try_deserialize()?;

        info!(
            "Configuration loaded successfully ({} feeds)",
            config.feeds.len()
        );
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        let intervals = [
            ("probe_interval_ms", c.probe_interval_ms),
            ("serving_interval_ms", c.serving_interval_ms),
            ("reconnect_delay_ms", c.reconnect_delay_ms),
            ("read_retry_delay_ms", c.read_retry_delay_ms),
            ("serving_idle_delay_ms", c.serving_idle_delay_ms),
            ("loss_timeout_ms", c.loss_timeout_ms),
            ("open_timeout_ms", c.open_timeout_ms),
            ("read_timeout_ms", c.read_timeout_ms),
            ("join_timeout_ms", c.join_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "connection.{} must be greater than 0",
                    name
                )));
            }
        }

        // restart_delay_ms may be 0: a restart is a one-off, not a retry loop

        if c.loss_timeout_ms <= c.probe_interval_ms {
            return Err(ConfigError::Message(
                "connection.loss_timeout_ms must exceed probe_interval_ms".to_string(),
            ));
        }

        if c.frame_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "connection.frame_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if c.fps_window_frames == 0 {
            return Err(ConfigError::Message(
                "connection.fps_window_frames must be greater than 0".to_string(),
            ));
        }

        let d = &self.diagnostics;
        if d.freeze_frames == 0 || d.no_motion_frames == 0 {
            return Err(ConfigError::Message(
                "diagnostics.freeze_frames and no_motion_frames must be greater than 0"
                    .to_string(),
            ));
        }

        if d.quality_window == 0 || d.recent_quality_samples == 0 {
            return Err(ConfigError::Message(
                "diagnostics.quality_window and recent_quality_samples must be greater than 0"
                    .to_string(),
            ));
        }

        if d.block_size < 2 {
            return Err(ConfigError::Message(
                "diagnostics.block_size must be at least 2".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&d.quality_good_threshold)
            || !(0.0..=1.0).contains(&d.block_ratio_threshold)
            || !(0.0..=1.0).contains(&d.edge_density_threshold)
        {
            return Err(ConfigError::Message(
                "diagnostics ratio thresholds must lie in [0, 1]".to_string(),
            ));
        }

        if d.canny_low > d.canny_high {
            return Err(ConfigError::Message(
                "diagnostics.canny_low must not exceed canny_high".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if !seen.insert(feed.id) {
                return Err(ConfigError::Message(format!(
                    "Duplicate feed id {}",
                    feed.id
                )));
            }
            if feed.url.trim().is_empty() {
                return Err(ConfigError::Message(format!(
                    "Feed {} has an empty url",
                    feed.id
                )));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_probe_interval_ms() -> u64 {
    100
}

fn default_serving_interval_ms() -> u64 {
    50
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_read_retry_delay_ms() -> u64 {
    2000
}

fn default_loss_timeout_ms() -> u64 {
    10_000
}

fn default_open_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_join_timeout_ms() -> u64 {
    5000
}

fn default_serving_idle_delay_ms() -> u64 {
    1000
}

fn default_frame_queue_capacity() -> usize {
    10
}

fn default_serving_direct_reads() -> bool {
    true
}

fn default_restart_delay_ms() -> u64 {
    2000
}

fn default_fps_window_frames() -> u64 {
    30
}

fn default_freeze_threshold() -> f64 {
    500.0
}

fn default_freeze_frames() -> u32 {
    3
}

fn default_motion_threshold() -> f64 {
    100.0
}

fn default_no_motion_frames() -> u32 {
    10
}

fn default_quality_threshold() -> f64 {
    30.0
}

fn default_blur_threshold() -> f64 {
    50.0
}

fn default_edge_density_threshold() -> f64 {
    0.01
}

fn default_block_ratio_threshold() -> f64 {
    0.3
}

fn default_block_size() -> u32 {
    8
}

fn default_block_std_threshold() -> f64 {
    5.0
}

fn default_quality_window() -> usize {
    5
}

fn default_quality_good_threshold() -> f64 {
    0.7
}

fn default_canny_low() -> f32 {
    50.0
}

fn default_canny_high() -> f32 {
    150.0
}

fn default_recent_quality_samples() -> usize {
    3
}

fn default_event_bus_capacity() -> usize {
    100
}

fn default_status_interval_secs() -> u64 {
    30
}
