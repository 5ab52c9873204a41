use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::Deserialize;
use std::ops::Range;
use std::sync::Arc;

use super::window::WindowFn;

/// Lowest frequency a band may start at.
const LOW_CUT_HZ: f32 = 20.0;

/// Value a band settles at when there is no energy in it.
pub const SMOOTHING_FLOOR: f32 = 0.0;

/// Per-band weighting applied on top of the log-spaced banding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Boost higher bands proportionally to the log of their centre frequency.
    Log,
    /// Every band weighs the same.
    #[default]
    Equal,
}

#[derive(Clone, Copy, Debug)]
pub struct SpectrumSettings {
    pub sample_rate: u32,
    pub sample_size: usize,
    pub bars: usize,
    /// 0.0 disables smoothing; values approaching 1.0 smooth heavily.
    pub smoothing: f32,
    pub window: WindowFn,
    pub distribution: Distribution,
}

/// Window, FFT and log-binned smoothing for one channel at a time.
///
/// The previous output doubles as the smoothing state: `process` blends the
/// new band energies into whatever `dest` already holds.
pub struct Spectrum {
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    window: Vec<f32>,
    bins: Vec<Range<usize>>,
    weights: Vec<f32>,
    smoothing: f32,
}

impl Spectrum {
    pub fn new(settings: &SpectrumSettings) -> Self {
        let size = settings.sample_size;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        let bins = log_bins(settings.sample_rate, size, settings.bars);
        let weights = band_weights(&bins, settings.distribution);

        Self {
            fft,
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch,
            window: settings.window.coefficients(size),
            bins,
            weights,
            smoothing: settings.smoothing.clamp(0.0, 0.99),
        }
    }

    pub fn bars(&self) -> usize {
        self.bins.len()
    }

    #[cfg(test)]
    fn bin_ranges(&self) -> &[Range<usize>] {
        &self.bins
    }

    /// Compute band energies for `input` and smooth them into `dest`.
    ///
    /// `input` is read only; windowing happens in the FFT buffer. Missing
    /// samples are treated as silence.
    pub fn process(&mut self, input: &[f32], dest: &mut [f32]) {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = input.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let keep = self.smoothing;
        for (band, out) in dest.iter_mut().take(self.bins.len()).enumerate() {
            let range = self.bins[band].clone();
            let magnitude = if range.is_empty() {
                0.0
            } else {
                let width = range.len() as f32;
                self.buffer[range].iter().map(|c| c.norm()).sum::<f32>() / width
            };
            let target = magnitude * self.weights[band];
            let blended = keep * *out + (1.0 - keep) * target;
            *out = if blended.is_finite() {
                blended.max(SMOOTHING_FLOOR)
            } else {
                SMOOTHING_FLOOR
            };
        }
    }
}

/// Split the FFT bins between `LOW_CUT_HZ` and Nyquist into `bars`
/// log-spaced, non-overlapping ranges. Each band gets at least one bin while
/// bins remain; bands past the last bin are empty.
fn log_bins(sample_rate: u32, size: usize, bars: usize) -> Vec<Range<usize>> {
    let nyquist_bin = size / 2;
    if bars == 0 || nyquist_bin == 0 {
        return vec![0..0; bars];
    }

    let resolution = sample_rate as f32 / size as f32;
    let low = (LOW_CUT_HZ / resolution).max(1.0).min(nyquist_bin as f32);
    let high = nyquist_bin as f32;
    let end = nyquist_bin + 1;

    let mut edges = Vec::with_capacity(bars + 1);
    let mut prev = (low.floor() as usize).min(end);
    edges.push(prev);
    for i in 1..=bars {
        let freq_bin = low * (high / low).powf(i as f32 / bars as f32);
        let mut edge = if i == bars { end } else { freq_bin.round() as usize };
        if edge <= prev {
            edge = prev + 1;
        }
        edge = edge.min(end);
        edges.push(edge);
        prev = edge;
    }

    edges.windows(2).map(|w| w[0]..w[1]).collect()
}

fn band_weights(bins: &[Range<usize>], distribution: Distribution) -> Vec<f32> {
    match distribution {
        Distribution::Equal => vec![1.0; bins.len()],
        Distribution::Log => {
            let centre = |r: &Range<usize>| (r.start + r.end) as f32 / 2.0;
            let base = bins.first().map(centre).unwrap_or(1.0).max(1.0);
            bins.iter()
                .map(|r| 1.0 + (centre(r).max(base) / base).log10())
                .collect()
        }
    }
}
