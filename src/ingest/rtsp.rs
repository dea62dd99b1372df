//! RTSP frame source backed by GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! videoscale ! RGB appsink`. The
//! appsink keeps only the newest buffer so a slow consumer never falls behind the
//! live stream.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::{CaptureOptions, FrameSource, SourceStats};
use crate::frame::Frame;

/// Reads that wait longer than this count as failed.
const PULL_TIMEOUT: Duration = Duration::from_millis(2_000);

pub struct RtspSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    open: bool,
    frame_count: u64,
    read_failures: u64,
    last_frame_at: Option<Instant>,
}

impl RtspSource {
    pub fn open(url: &str, options: &CaptureOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! videoscale ! \
             video/x-raw,format=RGB,width={},height={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url, options.width, options.height
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start RTSP pipeline for {}", url))?;
        log::info!("RtspSource: connected to {}", url);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            open: true,
            frame_count: 0,
            read_failures: 0,
            last_frame_at: None,
        })
    }

    /// Drain the pipeline bus; errors and end-of-stream close the handle.
    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    log::warn!(
                        "RtspSource: gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                    self.open = false;
                }
                MessageView::Eos(..) => {
                    log::warn!("RtspSource: {} reached end of stream", self.url);
                    self.open = false;
                }
                _ => {}
            }
        }
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }
}

impl FrameSource for RtspSource {
    fn read_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if !self.open {
            self.read_failures += 1;
            return Err(anyhow!("RTSP stream {} is closed", self.url));
        }
        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let sample = match self.appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None => {
                self.read_failures += 1;
                if self.appsink.is_eos() {
                    self.open = false;
                }
                return Err(anyhow!("RTSP stream {} stalled", self.url));
            }
        };

        let frame = sample_to_frame(&sample).inspect_err(|_| self.read_failures += 1)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.url, err);
        }
        if self.open {
            log::info!("RtspSource: closed {}", self.url);
        }
        self.open = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.url.clone(),
        }
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("RTSP buffer shorter than frame")?
            .to_vec();
        return Frame::rgb(pixels, width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Frame::rgb(pixels, width, height)
}
