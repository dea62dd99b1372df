//! Synthetic (`stub://`) frame source.
//!
//! Produces a moving gradient at the requested resolution. Query parameters script
//! failures for tests:
//! - `fail_every=N`: every Nth read fails, the handle stays open
//! - `close_after=N`: the stream ends after N frames
//! - `refuse=1`: opening fails with a connection error

use anyhow::{anyhow, Result};

use super::{CaptureOptions, FrameSource, SourceStats};
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fail_every: Option<u64>,
    pub close_after: Option<u64>,
    pub refuse: bool,
}

impl SyntheticConfig {
    pub fn from_uri(url: &str, options: &CaptureOptions) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source url must start with stub://"))?;
        let mut config = Self {
            url: url.to_string(),
            width: options.width,
            height: options.height,
            fail_every: None,
            close_after: None,
            refuse: false,
        };
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let number = || {
                value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("stub source option {} needs an integer, got '{}'", key, value))
            };
            match key {
                "fail_every" => config.fail_every = Some(number()?).filter(|n| *n > 0),
                "close_after" => config.close_after = Some(number()?),
                "refuse" => config.refuse = value != "0",
                other => return Err(anyhow!("unknown stub source option '{}'", other)),
            }
        }
        Ok(config)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    open: bool,
    reads: u64,
    frame_count: u64,
    read_failures: u64,
}

impl SyntheticSource {
    pub fn open(config: SyntheticConfig) -> Result<Self> {
        if config.refuse {
            return Err(anyhow!("connection to {} refused", config.url));
        }
        log::info!("SyntheticSource: connected to {}", config.url);
        Ok(Self {
            config,
            open: true,
            reads: 0,
            frame_count: 0,
            read_failures: 0,
        })
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let len = (self.config.width * self.config.height * 3) as usize;
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("{} is not open", self.config.url));
        }
        self.reads += 1;
        if self
            .config
            .fail_every
            .is_some_and(|n| self.reads % n == 0)
        {
            self.read_failures += 1;
            return Err(anyhow!("scripted read failure on {}", self.config.url));
        }
        if self
            .config
            .close_after
            .is_some_and(|n| self.frame_count >= n)
        {
            self.open = false;
            self.read_failures += 1;
            return Err(anyhow!("{} reached end of stream", self.config.url));
        }

        let pixels = self.generate_pixels();
        self.frame_count += 1;
        Frame::rgb(pixels, self.config.width, self.config.height)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            log::info!("SyntheticSource: closed {}", self.config.url);
        }
        self.open = false;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.config.url.clone(),
        }
    }
}
