//! HTTP camera source.
//!
//! Reads MJPEG (`multipart/x-mixed-replace`) streams such as phone webcam apps, or
//! polls a single-JPEG snapshot URL when the server does not stream.

use std::io::Read;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    connected_at: Instant,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    read_failures: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub fn open(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).context("parse camera url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("unsupported http camera scheme '{}'", parsed.scheme()));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http camera {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        };
        log::info!(
            "HttpSource: connected to {} ({})",
            url,
            if content_type.contains("multipart") {
                "mjpeg"
            } else {
                "snapshot"
            }
        );
        Ok(Self {
            url: url.to_string(),
            agent,
            stream: Some(stream),
            connected_at: Instant::now(),
            last_frame_at: None,
            frame_count: 0,
            read_failures: 0,
        })
    }

    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http camera {} is closed", self.url))?;
        match stream {
            HttpStream::Mjpeg(mjpeg) => match mjpeg.read_next_jpeg() {
                Ok(bytes) => Ok(bytes),
                Err(err) => {
                    if mjpeg.ended {
                        log::warn!("HttpSource: stream {} ended", self.url);
                        self.stream = None;
                    }
                    Err(err)
                }
            },
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.agent, &self.url),
        }
    }

    /// Seconds since the last decoded frame (or since connecting).
    pub fn idle_for(&self) -> Duration {
        self.last_frame_at.unwrap_or(self.connected_at).elapsed()
    }
}

impl FrameSource for HttpSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let frame = self
            .next_jpeg()
            .and_then(|bytes| Frame::from_jpeg(&bytes));
        match frame {
            Ok(frame) => {
                self.frame_count += 1;
                self.last_frame_at = Some(Instant::now());
                Ok(frame)
            }
            Err(err) => {
                self.read_failures += 1;
                Err(err)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!("HttpSource: closed {}", self.url);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            read_failures: self.read_failures,
            source: self.url.clone(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
    ended: bool,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
            ended: false,
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(read) => read,
                Err(err) => return Err(anyhow::Error::new(err).context("read mjpeg chunk")),
            };
            if read == 0 {
                self.ended = true;
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

/// Locate the first complete JPEG (SOI..EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
