//! Frame ingestion sources.
//!
//! This module provides different sources for raw frames:
//! - Synthetic `stub://` source (tests, demos)
//! - HTTP MJPEG / single-JPEG cameras such as phone webcams (feature: ingest-http)
//! - RTSP streams from IP cameras (feature: rtsp-gstreamer)
//! - USB/V4L2 devices by index (feature: ingest-v4l2)
//!
//! A source is opened once and read repeatedly. A failed read leaves the handle
//! open; the detection loop simply tries again on its next tick. When a backend
//! detects that its stream has ended for good it reports `is_open() == false` and
//! the loop reopens it.

#[cfg(feature = "ingest-http")]
pub mod http;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::fmt;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::frame::Frame;

#[cfg(feature = "ingest-http")]
pub use http::HttpSource;
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::RtspSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Video input abstraction.
pub trait FrameSource: Send {
    /// Capture the next frame.
    ///
    /// An error is a failed read (timeout, decode failure, dropped packet). It does
    /// not by itself close the source.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Whether the handle can still produce frames.
    fn is_open(&self) -> bool;

    /// Release the underlying device or connection. Idempotent.
    fn close(&mut self);

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub source: String,
}

/// Where frames come from: a local device index or a stream URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SourceDescriptor {
    Device(u32),
    Stream(String),
}

impl SourceDescriptor {
    /// A decimal integer is a device index; anything else is a stream URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("empty source descriptor"));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            let index = raw
                .parse::<u32>()
                .map_err(|err| anyhow!("invalid device index '{}': {}", raw, err))?;
            return Ok(Self::Device(index));
        }
        Ok(Self::Stream(raw.to_string()))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device {}", index),
            Self::Stream(url) => f.write_str(url),
        }
    }
}

/// Requested capture parameters. Backends that cannot honour them use what the
/// device offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// Open a source for `descriptor`. Fails when the connection cannot be made.
pub fn open_source(
    descriptor: &SourceDescriptor,
    options: &CaptureOptions,
) -> Result<Box<dyn FrameSource>> {
    match descriptor {
        SourceDescriptor::Stream(url) if url.starts_with("stub://") => {
            let config = SyntheticConfig::from_uri(url, options)?;
            Ok(Box::new(SyntheticSource::open(config)?))
        }
        SourceDescriptor::Stream(url)
            if url.starts_with("http://") || url.starts_with("https://") =>
        {
            #[cfg(feature = "ingest-http")]
            {
                Ok(Box::new(HttpSource::open(url)?))
            }
            #[cfg(not(feature = "ingest-http"))]
            {
                Err(anyhow!("{} requires the ingest-http feature", url))
            }
        }
        SourceDescriptor::Stream(url) if url.starts_with("rtsp://") => {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Box::new(RtspSource::open(url, options)?))
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                Err(anyhow!("{} requires the rtsp-gstreamer feature", url))
            }
        }
        SourceDescriptor::Stream(path) if path.starts_with("/dev/") => open_device(path, options),
        SourceDescriptor::Device(index) => open_device(&format!("/dev/video{}", index), options),
        SourceDescriptor::Stream(other) => Err(anyhow!("unsupported source '{}'", other)),
    }
}

#[allow(unused_variables)]
fn open_device(path: &str, options: &CaptureOptions) -> Result<Box<dyn FrameSource>> {
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::open(path, options)?))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!("capture device {} requires the ingest-v4l2 feature", path))
    }
}
