use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::capture::{CaptureBackend, CaptureError, CaptureSession, FrameSink, SessionConfig};
use super::decode::{decode_audio, remap_channels, resample_nearest};
use crate::cancel::CancelToken;

pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CaptureBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start_session(&self, config: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let audio = decode_audio(&self.path).map_err(|e| CaptureError::Decode(format!("{:#}", e)))?;

        let samples = remap_channels(&audio.samples, audio.channels, config.channels);
        if audio.sample_rate != config.sample_rate {
            log::info!(
                "Resampling {} from {}Hz to {}Hz",
                self.path.display(),
                audio.sample_rate,
                config.sample_rate
            );
        }
        let samples = resample_nearest(&samples, config.channels, audio.sample_rate, config.sample_rate);

        if samples.len() < config.frame_len() {
            return Err(CaptureError::Empty);
        }

        Ok(Box::new(ReplaySession {
            samples,
            frame_len: config.frame_len(),
            period: config.frame_period(),
        }))
    }
}

struct ReplaySession {
    samples: Vec<f32>,
    frame_len: usize,
    period: Duration,
}

impl CaptureSession for ReplaySession {
    fn run(self: Box<Self>, cancel: &CancelToken, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        let mut deadline = Instant::now();
        // A trailing partial frame is never delivered.
        for frame in self.samples.chunks_exact(self.frame_len) {
            sink.process(frame);
            deadline += self.period;
            if cancel.wait_until(deadline) {
                return Ok(());
            }
        }
        log::info!("Reached end of audio file");
        Ok(())
    }
}
