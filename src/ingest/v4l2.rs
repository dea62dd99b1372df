//! V4L2 frame source for local capture devices (`/dev/videoN`).

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{CaptureOptions, FrameSource, SourceStats};
use crate::frame::Frame;

pub struct V4l2Source {
    device_path: String,
    state: Option<DeviceState>,
    width: u32,
    height: u32,
    frame_count: u64,
    read_failures: u64,
    last_frame_at: Option<Instant>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    /// Open the device, request RGB24 at the configured resolution and start
    /// streaming. The driver may pick a different size; the negotiated one is used.
    pub fn open(device_path: &str, options: &CaptureOptions) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = options.width;
        format.height = options.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "v4l2 device {} does not offer RGB24 (got {})",
                device_path,
                format.fourcc
            ));
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: connected to {} ({}x{})",
            device_path,
            format.width,
            format.height
        );
        Ok(Self {
            device_path: device_path.to_string(),
            state: Some(state),
            width: format.width,
            height: format.height,
            frame_count: 0,
            read_failures: 0,
            last_frame_at: None,
        })
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }
}

impl FrameSource for V4l2Source {
    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("v4l2 device {} is closed", self.device_path))?;
        let captured = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, _meta)| buf.to_vec())
        });
        let pixels = match captured {
            Ok(pixels) => pixels,
            Err(err) => {
                self.read_failures += 1;
                return Err(anyhow::Error::new(err).context("capture v4l2 frame"));
            }
        };

        let expected = self.width as usize * self.height as usize * 3;
        if pixels.len() < expected {
            self.read_failures += 1;
            return Err(anyhow!(
                "short v4l2 frame: {} bytes, expected {}",
                pixels.len(),
                expected
            ));
        }
        let mut pixels = pixels;
        pixels.truncate(expected);

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::rgb(pixels, self.width, self.height)
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: closed {}", self.device_path);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.device_path.clone(),
        }
    }
}
