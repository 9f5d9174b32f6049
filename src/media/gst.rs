use super::{MediaHandle, MediaSource};
use crate::error::MediaError;
use crate::frame::{Frame, FrameFormat};
use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

/// Media source backed by a GStreamer `uridecodebin` pipeline.
///
/// Every frame is converted to GRAY8 inside the pipeline so the analyzer
/// never has to decode anything itself.
pub struct GstMediaSource {
    pull_timeout: Duration,
}

impl GstMediaSource {
    pub fn new(pull_timeout: Duration) -> Result<Self, MediaError> {
        gstreamer::init().map_err(|e| MediaError::Connection {
            address: String::new(),
            details: format!("Failed to initialize GStreamer: {}", e),
        })?;

        Ok(Self { pull_timeout })
    }

    fn pipeline_description(address: &str) -> String {
        format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=GRAY8 ! \
             appsink name=sink sync=false max-buffers=1 drop=true enable-last-sample=false",
            address
        )
    }
}

#[async_trait]
impl MediaSource for GstMediaSource {
    async fn open(&self, address: &str) -> Result<Box<dyn MediaHandle>, MediaError> {
        let description = Self::pipeline_description(address);
        debug!("Creating GStreamer pipeline: {}", description);

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| MediaError::connection(address, format!("Failed to create pipeline: {}", e)))?
            .downcast::<Pipeline>()
            .map_err(|_| MediaError::connection(address, "Failed to downcast to Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .and_then(|element| element.downcast::<AppSink>().ok())
            .ok_or_else(|| MediaError::connection(address, "Pipeline has no appsink"))?;

        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(MediaError::connection(
                address,
                format!("Failed to start pipeline: {}", e),
            ));
        }

        info!("GStreamer pipeline playing for {}", address);

        Ok(Box::new(GstHandle {
            address: address.to_string(),
            pipeline: Some(pipeline),
            appsink,
            pull_timeout: self.pull_timeout,
            next_id: 0,
        }))
    }

    fn name(&self) -> &str {
        "gstreamer"
    }
}

struct GstHandle {
    address: String,
    pipeline: Option<Pipeline>,
    appsink: AppSink,
    pull_timeout: Duration,
    next_id: u64,
}

impl GstHandle {
    fn sample_to_frame(&mut self, sample: gstreamer::Sample) -> Result<Frame, MediaError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| MediaError::decode("No buffer in sample"))?;
        let caps = sample
            .caps()
            .ok_or_else(|| MediaError::decode("No caps in sample"))?;
        let video_info = VideoInfo::from_caps(caps)
            .map_err(|e| MediaError::decode(format!("Failed to get video info: {}", e)))?;

        let width = video_info.width();
        let height = video_info.height();
        let stride = video_info.stride()[0] as usize;

        let map = buffer
            .map_readable()
            .map_err(|e| MediaError::decode(format!("Failed to map buffer: {}", e)))?;
        let bytes = map.as_slice();

        // rows may be padded past the visible width
        let row = width as usize;
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let end = start + row;
            if end > bytes.len() {
                return Err(MediaError::decode(format!(
                    "Buffer of {} bytes too short for {}x{} stride {}",
                    bytes.len(),
                    width,
                    height,
                    stride
                )));
            }
            data.extend_from_slice(&bytes[start..end]);
        }

        let id = self.next_id;
        self.next_id += 1;
        trace!("Pulled frame {} ({}x{}) from {}", id, width, height, self.address);

        Ok(Frame::new(
            id,
            SystemTime::now(),
            data,
            width,
            height,
            FrameFormat::Gray8,
        ))
    }
}

#[async_trait]
impl MediaHandle for GstHandle {
    async fn read_frame(&mut self) -> Result<Frame, MediaError> {
        if self.pipeline.is_none() {
            return Err(MediaError::decode("pipeline closed"));
        }

        let appsink = self.appsink.clone();
        let timeout = gstreamer::ClockTime::from_mseconds(self.pull_timeout.as_millis() as u64);

        let pulled = tokio::task::spawn_blocking(move || {
            let sample = appsink.try_pull_sample(timeout);
            (sample, appsink.is_eos())
        })
        .await
        .map_err(|e| MediaError::decode(format!("Pull task failed: {}", e)))?;

        match pulled {
            (Some(sample), _) => self.sample_to_frame(sample),
            (None, true) => Err(MediaError::decode("end of stream")),
            (None, false) => Err(MediaError::Timeout {
                waited: self.pull_timeout,
            }),
        }
    }

    async fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                warn!("Failed to stop pipeline for {}: {}", self.address, e);
            }
            debug!("GStreamer pipeline closed for {}", self.address);
        }
    }
}
