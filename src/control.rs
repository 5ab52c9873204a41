use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

use crate::actuator::{Actuator, TransportError};
use crate::audio::buffers::BarView;
use crate::audio::pipeline::BarPipeline;
use crate::cancel::CancelToken;

/// Anything the loop can poll for bars.
pub trait BarSource {
    /// Call `f` with the current bars. Returns false if no bars exist yet.
    fn with_bars(&self, f: &mut dyn FnMut(&BarView<'_>)) -> bool;
}

impl BarSource for BarPipeline {
    fn with_bars(&self, f: &mut dyn FnMut(&BarView<'_>)) -> bool {
        self.view(|view| f(view)).is_some()
    }
}

/// Maps a band amplitude onto `[min, max]` percent in steps of `modulus`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensityMap {
    pub min: i32,
    pub max: i32,
    /// Amplitude that maps to `max`; louder input is clamped.
    pub ceiling: f32,
    pub modulus: i32,
}

impl Default for IntensityMap {
    fn default() -> Self {
        Self {
            min: 0,
            max: 100,
            ceiling: 15.0,
            modulus: 1,
        }
    }
}

impl IntensityMap {
    pub fn validate(&self) -> Result<(), LoopError> {
        if !(0 <= self.min && self.min <= self.max && self.max <= 100) {
            return Err(LoopError::InvalidSettings(format!(
                "intensity range [{}, {}] must lie within [0, 100]",
                self.min, self.max
            )));
        }
        if !(self.ceiling > 0.0 && self.ceiling.is_finite()) {
            return Err(LoopError::InvalidSettings(format!(
                "ceiling {} must be positive",
                self.ceiling
            )));
        }
        if self.modulus < 1 {
            return Err(LoopError::InvalidSettings(format!(
                "modulus {} must be at least 1",
                self.modulus
            )));
        }
        Ok(())
    }

    pub fn percentage(&self, amplitude: f32) -> i32 {
        let amplitude = if amplitude.is_nan() { 0.0 } else { amplitude };
        let ratio = amplitude.clamp(0.0, self.ceiling) / self.ceiling;
        self.min + (ratio * (self.max - self.min) as f32).round() as i32
    }

    pub fn intensity(&self, amplitude: f32) -> i32 {
        quantize(self.percentage(amplitude), self.modulus)
    }
}

/// Round `pct` down to a multiple of `modulus`.
pub fn quantize(pct: i32, modulus: i32) -> i32 {
    if modulus <= 1 {
        return pct;
    }
    pct - pct.rem_euclid(modulus)
}

/// Remembers the last dispatched value and suppresses repeats.
#[derive(Clone, Copy, Debug, Default)]
pub struct Debouncer {
    last: Option<i32>,
}

impl Debouncer {
    pub fn with_last(last: i32) -> Self {
        Self { last: Some(last) }
    }

    /// True if `value` differs from the last accepted value.
    pub fn should_send(&self, value: i32) -> bool {
        self.last != Some(value)
    }

    pub fn accept(&mut self, value: i32) {
        self.last = Some(value);
    }

    pub fn forget(&mut self) {
        self.last = None;
    }
}

/// What the loop does when a dispatch fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the loop and return the error.
    #[default]
    Abort,
    /// Log the error and try again on the next tick.
    Continue,
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub tick: Duration,
    pub channel: usize,
    pub band: usize,
    pub map: IntensityMap,
    pub on_error: FailurePolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1) / 30,
            channel: 0,
            band: 2,
            map: IntensityMap::default(),
            on_error: FailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("invalid control settings: {0}")]
    InvalidSettings(String),
    #[error("failed to change intensity")]
    Transport(#[from] TransportError),
}

/// Outcome of a single tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// The pipeline has no bars yet.
    Idle,
    /// The value matched the last one sent.
    Unchanged(i32),
    Sent(i32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub sent: u64,
    pub failures: u64,
}

pub struct ActuationLoop<'a, S: BarSource + ?Sized, A: Actuator + ?Sized> {
    source: &'a S,
    actuator: &'a mut A,
    settings: LoopSettings,
    debounce: Debouncer,
}

impl<'a, S: BarSource + ?Sized, A: Actuator + ?Sized> ActuationLoop<'a, S, A> {
    pub fn new(source: &'a S, actuator: &'a mut A, settings: LoopSettings) -> Result<Self, LoopError> {
        settings.map.validate()?;
        if settings.tick.is_zero() {
            return Err(LoopError::InvalidSettings("tick period must be positive".into()));
        }
        Ok(Self {
            source,
            actuator,
            settings,
            debounce: Debouncer::default(),
        })
    }

    /// Start as if `last` had already been sent.
    pub fn with_last_sent(mut self, last: i32) -> Self {
        self.debounce = Debouncer::with_last(last);
        self
    }

    /// Sample, compare, and maybe dispatch once.
    pub fn tick(&mut self) -> Result<Tick, TransportError> {
        let (channel, band) = (self.settings.channel, self.settings.band);
        let mut amplitude = None;
        let ready = self.source.with_bars(&mut |view| amplitude = view.get(channel, band));
        if !ready {
            return Ok(Tick::Idle);
        }

        // A band outside the view reads as silence.
        let intensity = self.settings.map.intensity(amplitude.unwrap_or(0.0));
        if !self.debounce.should_send(intensity) {
            return Ok(Tick::Unchanged(intensity));
        }

        self.actuator.send(intensity)?;
        self.debounce.accept(intensity);
        Ok(Tick::Sent(intensity))
    }

    /// Tick at the configured rate until `cancel` fires, or until a dispatch
    /// fails under [`FailurePolicy::Abort`].
    pub fn run(&mut self, cancel: &CancelToken) -> Result<LoopStats, LoopError> {
        let mut stats = LoopStats::default();
        let mut last_tick = Instant::now();
        let mut deadline = last_tick;

        while !cancel.is_cancelled() {
            stats.ticks += 1;
            match self.tick() {
                Ok(Tick::Sent(_)) => stats.sent += 1,
                Ok(_) => {}
                Err(err) => {
                    stats.failures += 1;
                    match self.settings.on_error {
                        FailurePolicy::Abort => return Err(err.into()),
                        FailurePolicy::Continue if err.is_retryable() => {
                            log::warn!("Failed to change intensity, retrying: {}", err);
                            self.debounce.forget();
                        }
                        FailurePolicy::Continue => return Err(err.into()),
                    }
                }
            }

            let now = Instant::now();
            log::debug!("Latency: {}ms", now.duration_since(last_tick).as_millis());
            last_tick = now;

            deadline += self.settings.tick;
            if deadline < now {
                // Fell behind (slow dispatch); don't burst to catch up.
                deadline = now;
            }
            if cancel.wait_until(deadline) {
                break;
            }
        }

        Ok(stats)
    }
}
