mod actuator;
mod audio;
mod cancel;
mod cli;
mod config;
mod control;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use actuator::{Actuator, DryRunActuator, Target};
use audio::capture::{CaptureBackend, SilenceBackend};
use audio::device::{input_device_names, CpalBackend};
use audio::pipeline::{BarPipeline, StartError};
use audio::replay::FileBackend;
use cancel::CancelToken;
use cli::Cli;
use config::{Backend, Config};
use control::ActuationLoop;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        println!("Audio input devices:");
        for name in input_device_names().context("Failed to enumerate input devices")? {
            println!("  {}", name);
        }
        return Ok(());
    }

    // Load config: explicit --config path, or auto-detect bulbsync.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("bulbsync.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("bulbsync").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("bulbsync").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut cfg = match config_path {
        Some(ref path) => match config::load_config(path) {
            Ok(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            // A config the user named explicitly must load.
            Err(err) if cli.config.is_some() => return Err(err),
            Err(err) => {
                log::warn!("Ignoring config: {:#}", err);
                Config::default()
            }
        },
        None => Config::default(),
    };
    apply_overrides(&mut cfg, &cli);

    if let Some(level) = cli.set {
        let mut actuator = open_actuator(&cli, &cfg)?;
        let result = actuator.send(level);
        actuator.close();
        result.with_context(|| format!("Failed to set intensity to {}", level))?;
        log::info!("Intensity set to {}%", level);
        return Ok(());
    }

    let settings = cfg.loop_settings()?;
    let pipeline = Arc::new(BarPipeline::new(cfg.pipeline()));
    let backend = capture_backend(&cfg)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::info!("Interrupted, shutting down");
            cancel.cancel();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    log::info!("Starting {} capture", backend.name());
    let capture = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let result = pipeline.start(backend.as_ref(), &cancel);
                // No more frames are coming; stop the control loop too.
                cancel.cancel();
                result
            })
            .context("Failed to spawn capture thread")?
    };

    let mut actuator = match open_actuator(&cli, &cfg) {
        Ok(actuator) => actuator,
        Err(err) => {
            cancel.cancel();
            let _ = capture.join();
            return Err(err);
        }
    };

    let loop_result = ActuationLoop::new(pipeline.as_ref(), actuator.as_mut(), settings)
        .and_then(|mut control| control.run(&cancel));
    cancel.cancel();
    actuator.close();

    let capture_result = capture
        .join()
        .map_err(|_| anyhow!("Capture thread panicked"))?;

    let stats = loop_result.context("Control loop stopped")?;
    log::info!(
        "Done: {} ticks, {} intensity changes, {} failed sends",
        stats.ticks,
        stats.sent,
        stats.failures
    );

    match capture_result {
        Ok(()) => Ok(()),
        Err(StartError::AlreadyRunning) => Err(anyhow!("BUG: pipeline was started twice")),
        Err(err) => Err(err).context("Audio capture failed"),
    }
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    let audio = &mut cfg.audio;
    if let Some(backend) = cli.backend {
        audio.backend = backend;
    }
    if cli.device.is_some() {
        audio.device = cli.device.clone();
    }
    if let Some(ref file) = cli.file {
        audio.file = Some(file.clone());
        // Naming a file implies replaying it unless a backend was chosen.
        if cli.backend.is_none() {
            audio.backend = Backend::File;
        }
    }
    audio.sample_rate = cli.sample_rate.unwrap_or(audio.sample_rate);
    audio.sample_size = cli.sample_size.unwrap_or(audio.sample_size);
    audio.bars = cli.bars.unwrap_or(audio.bars);
    audio.smoothing = cli.smoothing.unwrap_or(audio.smoothing);
    audio.window = cli.window.unwrap_or(audio.window);
    audio.distribution = cli.distribution.unwrap_or(audio.distribution);

    let control = &mut cfg.control;
    control.tick_hz = cli.tick_hz.unwrap_or(control.tick_hz);
    control.channel = cli.channel.unwrap_or(control.channel);
    control.band = cli.band.unwrap_or(control.band);
    control.ceiling = cli.ceiling.unwrap_or(control.ceiling);
    control.min = cli.min.unwrap_or(control.min);
    control.max = cli.max.unwrap_or(control.max);
    control.modulus = cli.modulus.unwrap_or(control.modulus);
    control.on_error = cli.on_error.unwrap_or(control.on_error);

    cfg.actuator.qos = cli.qos.unwrap_or(cfg.actuator.qos);
    if cli.timeout_ms.is_some() {
        cfg.actuator.timeout_ms = cli.timeout_ms;
    }
}

fn capture_backend(cfg: &Config) -> Result<Box<dyn CaptureBackend + Send>> {
    Ok(match cfg.audio.backend {
        Backend::Cpal => Box::new(CpalBackend),
        Backend::File => {
            let path = cfg
                .audio
                .file
                .clone()
                .context("The file backend needs an audio file (--file or [audio] file)")?;
            Box::new(FileBackend::new(path))
        }
        Backend::Silence => Box::new(SilenceBackend),
    })
}

/// Resolve the endpoint (CLI, config, then the remembered URL) and connect.
fn open_actuator(cli: &Cli, cfg: &Config) -> Result<Box<dyn Actuator>> {
    if cli.dry_run {
        log::info!("Dry run: intensities will only be logged");
        return Ok(Box::new(DryRunActuator::default()));
    }

    let saved_path = config::saved_url_path();
    let raw = cli
        .url
        .clone()
        .or_else(|| cfg.actuator.url.clone())
        .or_else(|| {
            let url = saved_path.as_deref().and_then(config::load_saved_url)?;
            log::info!("Using remembered endpoint {}", url);
            Some(url)
        })
        .context("No dimmer endpoint: pass --url, set [actuator] url, or use --dry-run")?;

    let target = Target::parse(&raw)
        .and_then(|target| target.with_credentials(cli.username.clone(), cli.password.clone()))
        .with_context(|| format!("Invalid endpoint: {}", config::redact_url(&raw).unwrap_or_default()))?;
    let actuator = actuator::connect(&target, &cfg.transport()?).context("Failed to open dimmer transport")?;

    if cli.save_url {
        match saved_path {
            Some(ref path) => remember_url(path, &raw, cli.username.as_deref()),
            None => log::warn!("No config directory; not remembering the endpoint"),
        }
    }
    Ok(actuator)
}

fn remember_url(path: &Path, raw: &str, username: Option<&str>) {
    let mut url = match Url::parse(raw.trim()) {
        Ok(url) => url,
        Err(err) => {
            log::warn!("Not remembering endpoint: {}", err);
            return;
        }
    };
    if let Some(username) = username {
        let _ = url.set_username(username);
    }
    match config::save_url(path, url.as_str()) {
        Ok(()) => log::info!("Remembered endpoint in {}", path.display()),
        Err(err) => log::warn!("{:#}", err),
    }
}
