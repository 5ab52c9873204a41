use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::buffers::{BarStore, BarView, FrameBuffers};
use super::capture::{CaptureBackend, CaptureError, CaptureSession, FrameSink, SessionConfig};
use super::spectrum::{Distribution, Spectrum, SpectrumSettings};
use super::window::WindowFn;
use crate::cancel::CancelToken;

/// The pipeline always analyses a stereo pair.
pub const CHANNELS: usize = 2;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub sample_size: usize,
    pub bars: usize,
    pub smoothing: f32,
    pub window: WindowFn,
    pub distribution: Distribution,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), StartError> {
        let invalid = |msg: String| -> Result<(), StartError> { Err(StartError::InvalidConfig(msg)) };
        if self.sample_rate == 0 {
            return invalid("sample rate must be positive".into());
        }
        if self.sample_size == 0 {
            return invalid("sample size must be positive".into());
        }
        if self.bars == 0 || self.bars > self.sample_size {
            return invalid(format!(
                "bar count {} must be between 1 and the sample size {}",
                self.bars, self.sample_size
            ));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return invalid(format!("smoothing {} must be in [0, 1)", self.smoothing));
        }
        Ok(())
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            device: self.device.clone(),
            channels: CHANNELS,
            sample_size: self.sample_size,
            sample_rate: self.sample_rate,
        }
    }

    fn spectrum_settings(&self) -> SpectrumSettings {
        SpectrumSettings {
            sample_rate: self.sample_rate,
            sample_size: self.sample_size,
            bars: self.bars,
            smoothing: self.smoothing,
            window: self.window,
            distribution: self.distribution,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    /// `start` was called on a pipeline that already started. Starting twice
    /// would re-alias the buffers under a running session, so callers should
    /// treat this as a bug.
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("failed to start the input backend")]
    Backend(#[source] CaptureError),
    #[error("input session failed")]
    Session(#[source] CaptureError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Running,
}

/// The capture thread calls [`BarPipeline::process_frame`], which only copies
/// samples. Spectrum work happens lazily in [`BarPipeline::view`] on the
/// consumer's thread, under the same lock, so a view never sees a half-copied
/// frame or half-computed bars.
pub struct BarPipeline {
    config: PipelineConfig,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    running: Option<Running>,
}

struct Running {
    frames: FrameBuffers,
    bars: BarStore,
    spectrum: Spectrum,
    /// Frames copied into the read buffer so far.
    copied: u64,
    /// Value of `copied` the bars were last computed from.
    computed: Option<u64>,
}

impl Running {
    fn allocate(config: &PipelineConfig) -> Self {
        Self {
            frames: FrameBuffers::allocate(CHANNELS, config.sample_size),
            bars: BarStore::allocate(CHANNELS, config.sample_size, config.bars),
            spectrum: Spectrum::new(&config.spectrum_settings()),
            copied: 0,
            computed: None,
        }
    }

    fn recompute(&mut self) {
        if self.computed == Some(self.copied) {
            return;
        }
        let Running { frames, bars, spectrum, .. } = self;
        for channel in 0..bars.channels() {
            spectrum.process(frames.read_channel(channel), bars.buf_mut(channel));
        }
        self.computed = Some(self.copied);
    }
}

impl BarPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(Shared::default()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        match self.lock().running {
            Some(_) => PipelineState::Running,
            None => PipelineState::Uninitialized,
        }
    }

    /// Allocate the buffers, open a capture session on `backend` and feed it
    /// into this pipeline until the session ends or `cancel` fires.
    ///
    /// Blocks for the whole session, so run it on its own thread. May only
    /// succeed once per pipeline.
    pub fn start(self: &Arc<Self>, backend: &dyn CaptureBackend, cancel: &CancelToken) -> Result<(), StartError> {
        let session = self.init(backend)?;
        log::info!(
            "Capture session started: {} backend, {}Hz, {} samples, {} bars",
            backend.name(),
            self.config.sample_rate,
            self.config.sample_size,
            self.config.bars
        );

        let sink: Arc<dyn FrameSink> = self.clone();
        session.run(cancel, sink).map_err(StartError::Session)?;

        log::info!("Capture session ended");
        Ok(())
    }

    fn init(&self, backend: &dyn CaptureBackend) -> Result<Box<dyn CaptureSession>, StartError> {
        let mut shared = self.lock();
        if shared.running.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        self.config.validate()?;

        let session = backend
            .start_session(&self.config.session_config())
            .map_err(StartError::Backend)?;
        shared.running = Some(Running::allocate(&self.config));
        Ok(session)
    }

    /// Copy one interleaved frame into the read buffer. Frames arriving
    /// before `start` or with the wrong length are dropped.
    pub fn process_frame(&self, frame: &[f32]) {
        let mut shared = self.lock();
        let Some(running) = shared.running.as_mut() else {
            return;
        };
        if !running.frames.write_frame(frame) {
            log::warn!(
                "Dropping malformed frame: {} samples, expected {}",
                frame.len(),
                running.frames.frame_len()
            );
            return;
        }
        running.frames.swap_to_read();
        running.copied += 1;
        log::trace!("Copied frame {}", running.copied);
    }

    /// Recompute the bars if a new frame arrived, then hand them to `f`.
    /// Returns `None` without calling `f` if the pipeline has not started.
    pub fn view<R>(&self, f: impl FnOnce(&BarView<'_>) -> R) -> Option<R> {
        let mut shared = self.lock();
        let running = shared.running.as_mut()?;
        running.recompute();
        Some(f(&running.bars.view()))
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for BarPipeline {
    fn process(&self, frame: &[f32]) {
        self.process_frame(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::spectrum::SMOOTHING_FLOOR;
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> PipelineConfig {
        PipelineConfig {
            device: None,
            sample_rate: 16000,
            sample_size: 500,
            bars: 10,
            smoothing: 0.0,
            window: WindowFn::Rectangular,
            distribution: Distribution::Equal,
        }
    }

    /// Session that delivers nothing and waits for cancellation.
    struct IdleBackend;

    impl CaptureBackend for IdleBackend {
        fn name(&self) -> &'static str {
            "idle"
        }

        fn start_session(&self, _: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError> {
            Ok(Box::new(IdleSession))
        }
    }

    struct IdleSession;

    impl CaptureSession for IdleSession {
        fn run(self: Box<Self>, cancel: &CancelToken, _: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
            while !cancel.wait_timeout(Duration::from_secs(60)) {}
            Ok(())
        }
    }

    /// Session that delivers a fixed list of frames and ends.
    struct ScriptedBackend(Vec<Vec<f32>>);

    impl CaptureBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn start_session(&self, _: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError> {
            Ok(Box::new(ScriptedSession(self.0.clone())))
        }
    }

    struct ScriptedSession(Vec<Vec<f32>>);

    impl CaptureSession for ScriptedSession {
        fn run(self: Box<Self>, _: &CancelToken, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
            for frame in &self.0 {
                sink.process(frame);
            }
            Ok(())
        }
    }

    struct BrokenBackend;

    impl CaptureBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn start_session(&self, _: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError> {
            Err(CaptureError::NoDefaultDevice)
        }
    }

    fn spawn_idle(pipeline: &Arc<BarPipeline>, cancel: &CancelToken) -> thread::JoinHandle<Result<(), StartError>> {
        let pipeline = Arc::clone(pipeline);
        let cancel = cancel.clone();
        thread::spawn(move || pipeline.start(&IdleBackend, &cancel))
    }

    fn wait_running(pipeline: &BarPipeline) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.state() != PipelineState::Running {
            assert!(Instant::now() < deadline, "pipeline never started");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn stereo_sine(cycles: f32, amplitude: f32) -> Vec<f32> {
        (0..500)
            .flat_map(|i| {
                let s = amplitude * (2.0 * std::f32::consts::PI * cycles * i as f32 / 500.0).sin();
                [s, s]
            })
            .collect()
    }

    #[test]
    fn view_before_start_is_a_no_op() {
        let pipeline = BarPipeline::new(config());
        let mut called = false;
        assert!(pipeline.view(|_| called = true).is_none());
        assert!(!called);
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn frames_before_start_are_ignored() {
        let pipeline = BarPipeline::new(config());
        pipeline.process_frame(&[1.0; 1000]);
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn second_start_reports_already_running() {
        let pipeline = Arc::new(BarPipeline::new(config()));
        let cancel = CancelToken::new();
        let handle = spawn_idle(&pipeline, &cancel);
        wait_running(&pipeline);

        let second = pipeline.start(&IdleBackend, &cancel);
        assert!(matches!(second, Err(StartError::AlreadyRunning)));

        cancel.cancel();
        assert!(handle.join().unwrap().is_ok());
        assert!(matches!(
            pipeline.start(&IdleBackend, &cancel),
            Err(StartError::AlreadyRunning)
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_backend() {
        for broken in [
            PipelineConfig { sample_size: 0, ..config() },
            PipelineConfig { bars: 0, ..config() },
            PipelineConfig { bars: 501, ..config() },
            PipelineConfig { sample_rate: 0, ..config() },
            PipelineConfig { smoothing: 1.0, ..config() },
        ] {
            let pipeline = Arc::new(BarPipeline::new(broken));
            let result = pipeline.start(&BrokenBackend, &CancelToken::new());
            assert!(matches!(result, Err(StartError::InvalidConfig(_))));
            assert_eq!(pipeline.state(), PipelineState::Uninitialized);
        }
    }

    #[test]
    fn backend_failure_leaves_pipeline_uninitialized() {
        let pipeline = Arc::new(BarPipeline::new(config()));
        let result = pipeline.start(&BrokenBackend, &CancelToken::new());
        assert!(matches!(result, Err(StartError::Backend(CaptureError::NoDefaultDevice))));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn silent_frame_yields_floor_bars() {
        let pipeline = Arc::new(BarPipeline::new(config()));
        let backend = ScriptedBackend(vec![vec![0.0; 1000]]);
        pipeline.start(&backend, &CancelToken::new()).unwrap();

        let bars = pipeline
            .view(|view| view.iter().map(|lane| lane.to_vec()).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(bars.len(), 2);
        for lane in bars {
            assert_eq!(lane.len(), 10);
            assert!(lane.iter().all(|b| !b.is_nan() && *b == SMOOTHING_FLOOR));
        }
    }

    #[test]
    fn repeated_views_are_identical_until_a_new_frame() {
        let pipeline = Arc::new(BarPipeline::new(PipelineConfig {
            smoothing: 0.5,
            ..config()
        }));
        let cancel = CancelToken::new();
        let handle = spawn_idle(&pipeline, &cancel);
        wait_running(&pipeline);

        pipeline.process_frame(&stereo_sine(4.0, 1.0));
        let snapshot = |p: &BarPipeline| p.view(|v| v.channel(0).to_vec()).unwrap();
        let first = snapshot(&pipeline);
        let second = snapshot(&pipeline);
        assert_eq!(
            first.iter().map(|b| b.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|b| b.to_bits()).collect::<Vec<_>>()
        );

        pipeline.process_frame(&stereo_sine(4.0, 1.0));
        let third = snapshot(&pipeline);
        assert!(third[2] > second[2]);

        cancel.cancel();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn malformed_frame_does_not_replace_read_buffer() {
        let pipeline = Arc::new(BarPipeline::new(config()));
        let cancel = CancelToken::new();
        let handle = spawn_idle(&pipeline, &cancel);
        wait_running(&pipeline);

        pipeline.process_frame(&stereo_sine(4.0, 1.0));
        let before = pipeline.view(|v| v.get(0, 2)).flatten().unwrap();
        pipeline.process_frame(&[0.0; 999]);
        let after = pipeline.view(|v| v.get(0, 2)).flatten().unwrap();
        assert_eq!(before, after);
        assert!(before > 0.0);

        cancel.cancel();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn concurrent_views_never_see_torn_frames() {
        // Bars of every frame the producer can deliver (plus the zeroed
        // start), as bit patterns. Negating a frame leaves its bars unchanged.
        let expected: Arc<HashSet<Vec<u32>>> = {
            let mut spectrum = Spectrum::new(&config().spectrum_settings());
            Arc::new(
                (0..=2000)
                    .map(|k| {
                        let mut bars = vec![0.0; 10];
                        spectrum.process(&vec![k as f32; 500], &mut bars);
                        bars.iter().map(|b| b.to_bits()).collect()
                    })
                    .collect(),
            )
        };

        let pipeline = Arc::new(BarPipeline::new(config()));
        let cancel = CancelToken::new();
        let handle = spawn_idle(&pipeline, &cancel);
        wait_running(&pipeline);

        let producer = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                // Each frame is uniform: left = k, right = -k.
                for k in 1..=2000 {
                    let frame: Vec<f32> = (0..500).flat_map(|_| [k as f32, -(k as f32)]).collect();
                    pipeline.process_frame(&frame);
                }
            })
        };

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                let expected = Arc::clone(&expected);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let checked = pipeline.view(|view| {
                            let left: Vec<u32> = view.channel(0).iter().map(|b| b.to_bits()).collect();
                            let right: Vec<u32> = view.channel(1).iter().map(|b| b.to_bits()).collect();
                            assert!(expected.contains(&left), "left bars from a torn frame: {:?}", view.channel(0));
                            assert_eq!(left, right);
                        });
                        assert!(checked.is_some());

                        let shared = pipeline.lock();
                        let running = shared.running.as_ref().unwrap();
                        let left = running.frames.read_channel(0);
                        let right = running.frames.read_channel(1);
                        assert!(left.iter().all(|&s| s == left[0]));
                        assert!(right.iter().all(|&s| s == -left[0]));
                    }
                })
            })
            .collect();

        producer.join().unwrap();
        for consumer in consumers {
            consumer.join().unwrap();
        }
        cancel.cancel();
        handle.join().unwrap().unwrap();
    }
}
