use clap::Parser;
use std::path::PathBuf;

use crate::audio::spectrum::Distribution;
use crate::audio::window::WindowFn;
use crate::config::Backend;
use crate::control::FailurePolicy;

#[derive(Parser, Debug)]
#[command(name = "bulbsync", about = "Drive a dimmable light from live audio")]
pub struct Cli {
    /// Config file (default: ./bulbsync.toml or the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Dimmer endpoint: http://host or mqtt://host[:port]/base/topic
    #[arg(short, long, env = "BULBSYNC_URL")]
    pub url: Option<String>,

    /// Username for the endpoint (overrides the URL's)
    #[arg(long, env = "BULBSYNC_USERNAME")]
    pub username: Option<String>,

    /// Password for the endpoint (overrides the URL's)
    #[arg(long, env = "BULBSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Remember the endpoint URL (password redacted) after connecting
    #[arg(long)]
    pub save_url: bool,

    /// Send a single intensity (0-100) and exit
    #[arg(long, value_name = "PERCENT", allow_negative_numbers = true)]
    pub set: Option<i32>,

    /// Log intensities instead of sending them
    #[arg(long)]
    pub dry_run: bool,

    /// List audio input devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Capture backend
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Input device name (cpal backend)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Audio file to replay (file backend)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Capture sample rate in Hz
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Samples per channel per frame
    #[arg(long)]
    pub sample_size: Option<usize>,

    /// Number of frequency bands
    #[arg(long)]
    pub bars: Option<usize>,

    /// Spectrum smoothing factor (0.0-1.0)
    #[arg(long)]
    pub smoothing: Option<f32>,

    /// FFT window function
    #[arg(long, value_enum)]
    pub window: Option<WindowFn>,

    /// Band weighting
    #[arg(long, value_enum)]
    pub distribution: Option<Distribution>,

    /// Control loop rate in Hz
    #[arg(long)]
    pub tick_hz: Option<f32>,

    /// Channel to follow (0 = left, 1 = right)
    #[arg(long)]
    pub channel: Option<usize>,

    /// Band to follow
    #[arg(long)]
    pub band: Option<usize>,

    /// Band amplitude that maps to full brightness
    #[arg(long)]
    pub ceiling: Option<f32>,

    /// Lowest intensity percentage
    #[arg(long)]
    pub min: Option<i32>,

    /// Highest intensity percentage
    #[arg(long)]
    pub max: Option<i32>,

    /// Only change intensity in steps of this size
    #[arg(long)]
    pub modulus: Option<i32>,

    /// What to do when sending an intensity fails
    #[arg(long, value_enum)]
    pub on_error: Option<FailurePolicy>,

    /// MQTT QoS: 0 fire-and-forget, 1 wait for acknowledgement
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub qos: Option<u8>,

    /// Network timeout in milliseconds (default: wait indefinitely)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}
