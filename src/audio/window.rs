use serde::Deserialize;
use std::f32::consts::PI;

/// Window applied to each channel's samples before the FFT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WindowFn {
    #[default]
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowFn {
    /// Coefficients for a window of `size` samples.
    pub fn coefficients(self, size: usize) -> Vec<f32> {
        if size <= 1 {
            return vec![1.0; size];
        }
        let denom = (size - 1) as f32;
        (0..size)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / denom;
                match self {
                    WindowFn::Rectangular => 1.0,
                    WindowFn::Hann => 0.5 * (1.0 - x.cos()),
                    WindowFn::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowFn::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangular_is_flat() {
        assert!(WindowFn::Rectangular.coefficients(16).iter().all(|&c| c == 1.0));
    }

    #[test]
    fn hann_tapers_to_zero_at_edges() {
        let w = WindowFn::Hann.coefficients(65);
        assert!(w[0].abs() < 1e-6);
        assert!(w[64].abs() < 1e-6);
        assert!((w[32] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tiny_sizes_do_not_divide_by_zero() {
        assert_eq!(WindowFn::Blackman.coefficients(1), vec![1.0]);
        assert!(WindowFn::Hamming.coefficients(0).is_empty());
    }
}
