use anyhow::{Context, Result};
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actuator::{TransportOptions, REDACTED_PASSWORD};
use crate::audio::pipeline::PipelineConfig;
use crate::audio::spectrum::Distribution;
use crate::audio::window::WindowFn;
use crate::control::{FailurePolicy, IntensityMap, LoopSettings};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Live input device
    #[default]
    Cpal,
    /// Replay an audio file in real time
    File,
    /// Endless silence
    Silence,
}

#[derive(Debug, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_bars")]
    pub bars: usize,
    #[serde(default)]
    pub smoothing: f32,
    #[serde(default)]
    pub window: WindowFn,
    #[serde(default)]
    pub distribution: Distribution,
}

#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_tick_hz")]
    pub tick_hz: f32,
    #[serde(default)]
    pub channel: usize,
    #[serde(default = "default_band")]
    pub band: usize,
    #[serde(default = "default_ceiling")]
    pub ceiling: f32,
    #[serde(default)]
    pub min: i32,
    #[serde(default = "default_max")]
    pub max: i32,
    #[serde(default = "default_modulus")]
    pub modulus: i32,
    #[serde(default)]
    pub on_error: FailurePolicy,
}

#[derive(Debug, Deserialize)]
pub struct ActuatorConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            device: None,
            file: None,
            sample_rate: default_sample_rate(),
            sample_size: default_sample_size(),
            bars: default_bars(),
            smoothing: 0.0,
            window: WindowFn::default(),
            distribution: Distribution::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            channel: 0,
            band: default_band(),
            ceiling: default_ceiling(),
            min: 0,
            max: default_max(),
            modulus: default_modulus(),
            on_error: FailurePolicy::default(),
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            url: None,
            qos: default_qos(),
            timeout_ms: None,
            client_id: default_client_id(),
        }
    }
}

fn default_sample_rate() -> u32 { 16000 }
fn default_sample_size() -> usize { 500 }
fn default_bars() -> usize { 10 }
fn default_tick_hz() -> f32 { 30.0 }
fn default_band() -> usize { 2 }
fn default_ceiling() -> f32 { 15.0 }
fn default_max() -> i32 { 100 }
fn default_modulus() -> i32 { 1 }
fn default_qos() -> u8 { 1 }
fn default_client_id() -> String { "bulbsync".into() }

impl Config {
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            device: self.audio.device.clone(),
            sample_rate: self.audio.sample_rate,
            sample_size: self.audio.sample_size,
            bars: self.audio.bars,
            smoothing: self.audio.smoothing,
            window: self.audio.window,
            distribution: self.audio.distribution,
        }
    }

    pub fn loop_settings(&self) -> Result<LoopSettings> {
        let c = &self.control;
        if !(c.tick_hz > 0.0 && c.tick_hz.is_finite()) {
            anyhow::bail!("tick rate must be positive, got {}", c.tick_hz);
        }
        if c.channel >= crate::audio::pipeline::CHANNELS {
            anyhow::bail!("channel {} does not exist (stereo input)", c.channel);
        }
        if c.band >= self.audio.bars {
            anyhow::bail!("band {} is outside the {} configured bars", c.band, self.audio.bars);
        }
        let tick = Duration::try_from_secs_f64(1.0 / c.tick_hz as f64)
            .with_context(|| format!("tick rate {} Hz is too slow", c.tick_hz))?;
        Ok(LoopSettings {
            tick,
            channel: c.channel,
            band: c.band,
            map: IntensityMap {
                min: c.min,
                max: c.max,
                ceiling: c.ceiling,
                modulus: c.modulus,
            },
            on_error: c.on_error,
        })
    }

    pub fn transport(&self) -> Result<TransportOptions> {
        if self.actuator.qos > 1 {
            anyhow::bail!("qos must be 0 or 1, got {}", self.actuator.qos);
        }
        Ok(TransportOptions {
            timeout: self.actuator.timeout_ms.map(Duration::from_millis),
            qos: self.actuator.qos,
            client_id: self.actuator.client_id.clone(),
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
}

/// Where the last successfully used endpoint URL is remembered.
pub fn saved_url_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("bulbsync").join("url"))
}

pub fn load_saved_url(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let raw = content.trim();
    match Url::parse(raw) {
        Ok(_) => Some(raw.to_string()),
        Err(err) => {
            log::warn!("Invalid saved URL in {}: {}", path.display(), err);
            None
        }
    }
}

/// Persist `raw` with its password replaced by a placeholder.
pub fn save_url(path: &Path, raw: &str) -> Result<()> {
    let redacted = redact_url(raw)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
    }
    std::fs::write(path, redacted).with_context(|| format!("Failed to save URL: {}", path.display()))
}

pub fn redact_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim()).context("Invalid URL")?;
    if url.password().is_some() {
        let _ = url.set_password(Some(REDACTED_PASSWORD));
    }
    Ok(url.to_string())
}
