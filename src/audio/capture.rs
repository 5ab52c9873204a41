use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cancel::CancelToken;

/// Shape of the frames a capture session must deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Input device name; `None` picks the backend's default.
    pub device: Option<String>,
    pub channels: usize,
    pub sample_size: usize,
    pub sample_rate: u32,
}

impl SessionConfig {
    /// Interleaved samples per frame.
    pub fn frame_len(&self) -> usize {
        self.channels * self.sample_size
    }

    /// Wall-clock time one frame covers.
    pub fn frame_period(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_size as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no default input device")]
    NoDefaultDevice,
    #[error("no input device named {0:?}")]
    NoDevice(String),
    #[error("failed to enumerate input devices")]
    Devices(#[from] cpal::DevicesError),
    #[error("failed to query input config")]
    StreamConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("unsupported sample format {0}")]
    UnsupportedFormat(cpal::SampleFormat),
    #[error("failed to build input stream")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start input stream")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("input stream failed")]
    Stream(#[from] cpal::StreamError),
    #[error("failed to decode audio: {0}")]
    Decode(String),
    #[error("no audio to replay")]
    Empty,
}

/// Receives every complete frame a session captures. Called from the
/// backend's own thread.
pub trait FrameSink: Send + Sync {
    /// `frame` holds `channels * sample_size` interleaved samples.
    fn process(&self, frame: &[f32]);
}

pub trait CaptureBackend {
    fn name(&self) -> &'static str;

    fn start_session(&self, config: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError>;
}

pub trait CaptureSession {
    /// Deliver frames to `sink` until the session ends on its own or
    /// `cancel` fires.
    fn run(self: Box<Self>, cancel: &CancelToken, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError>;
}

/// Re-chunks arbitrarily sized callback buffers into exact frames.
pub struct FrameChunker {
    frame: Vec<f32>,
    filled: usize,
}

impl FrameChunker {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame: vec![0.0; frame_len],
            filled: 0,
        }
    }

    pub fn push(&mut self, mut data: &[f32], mut emit: impl FnMut(&[f32])) {
        if self.frame.is_empty() {
            return;
        }
        while !data.is_empty() {
            let take = (self.frame.len() - self.filled).min(data.len());
            self.frame[self.filled..self.filled + take].copy_from_slice(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == self.frame.len() {
                emit(&self.frame);
                self.filled = 0;
            }
        }
    }
}

/// Streaming counterpart of `decode::remap_channels` + `decode::resample_nearest`
/// for devices whose native layout differs from the session's. Position is
/// kept across calls, so how the input is split into blocks never changes
/// the output.
pub struct Conformer {
    from_channels: usize,
    to_channels: usize,
    from_rate: u64,
    to_rate: u64,
    /// Input frames consumed by earlier blocks.
    consumed: u64,
    /// Index of the next output frame.
    produced: u64,
    out: Vec<f32>,
}

impl Conformer {
    pub fn new(from_channels: usize, from_rate: u32, to_channels: usize, to_rate: u32) -> Self {
        Self {
            from_channels,
            to_channels,
            from_rate: from_rate as u64,
            to_rate: to_rate as u64,
            consumed: 0,
            produced: 0,
            out: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_channels == self.to_channels && self.from_rate == self.to_rate
    }

    /// Convert one interleaved block. A trailing partial frame is ignored.
    pub fn convert(&mut self, input: &[f32]) -> &[f32] {
        self.out.clear();
        if self.from_channels == 0 || self.from_rate == 0 || self.to_rate == 0 {
            return &self.out;
        }
        let frames = (input.len() / self.from_channels) as u64;
        let end = self.consumed + frames;
        loop {
            let src = self.produced * self.from_rate / self.to_rate;
            if src >= end {
                break;
            }
            let at = (src - self.consumed) as usize * self.from_channels;
            let frame = &input[at..at + self.from_channels];
            for ch in 0..self.to_channels {
                self.out.push(frame[ch.min(self.from_channels - 1)]);
            }
            self.produced += 1;
        }
        self.consumed = end;
        &self.out
    }
}

/// Feeds all-zero frames at real-time cadence until cancelled.
pub struct SilenceBackend;

impl CaptureBackend for SilenceBackend {
    fn name(&self) -> &'static str {
        "silence"
    }

    fn start_session(&self, config: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError> {
        Ok(Box::new(SilenceSession {
            frame: vec![0.0; config.frame_len()],
            period: config.frame_period(),
        }))
    }
}

struct SilenceSession {
    frame: Vec<f32>,
    period: Duration,
}

impl CaptureSession for SilenceSession {
    fn run(self: Box<Self>, cancel: &CancelToken, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        let mut deadline = Instant::now();
        loop {
            sink.process(&self.frame);
            deadline += self.period;
            if cancel.wait_until(deadline) {
                return Ok(());
            }
        }
    }
}
