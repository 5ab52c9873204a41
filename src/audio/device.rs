use std::sync::Arc;

use crossbeam_channel::Sender;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::capture::{
    CaptureBackend, CaptureError, CaptureSession, Conformer, FrameChunker, FrameSink, SessionConfig,
};
use crate::cancel::CancelToken;

/// Captures from the session's named input device, or the host default.
/// The device is opened in its own default format and converted to the
/// session's channel count and rate on the fly.
pub struct CpalBackend;

/// Names of the available input devices on the default host.
pub fn input_device_names() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    Ok(host
        .input_devices()?
        .filter_map(|d| d.name().ok())
        .collect())
}

impl CaptureBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn start_session(&self, config: &SessionConfig) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let host = cpal::default_host();
        let device = match &config.device {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::NoDevice(name.clone()))?,
            None => host.default_input_device().ok_or(CaptureError::NoDefaultDevice)?,
        };

        let native = device.default_input_config()?;
        let sample_format = native.sample_format();
        let stream_config: StreamConfig = native.into();

        log::info!(
            "Audio input: {} @ {}Hz, {} channels, {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            stream_config.sample_rate.0,
            stream_config.channels,
            sample_format
        );
        let conformer = Conformer::new(
            stream_config.channels as usize,
            stream_config.sample_rate.0,
            config.channels,
            config.sample_rate,
        );
        if !conformer.is_passthrough() {
            log::info!(
                "Converting input to {}Hz, {} channels",
                config.sample_rate,
                config.channels
            );
        }

        Ok(Box::new(CpalSession {
            device,
            stream_config,
            sample_format,
            conformer,
            frame_len: config.frame_len(),
        }))
    }
}

struct CpalSession {
    device: Device,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
    conformer: Conformer,
    frame_len: usize,
}

impl CaptureSession for CpalSession {
    fn run(self: Box<Self>, cancel: &CancelToken, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        let CpalSession {
            device,
            stream_config,
            sample_format,
            conformer,
            frame_len,
        } = *self;
        let (err_tx, err_rx) = crossbeam_channel::bounded(1);
        let chunker = FrameChunker::new(frame_len);

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, conformer, chunker, sink, err_tx)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, conformer, chunker, sink, err_tx)?,
            SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, conformer, chunker, sink, err_tx)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, conformer, chunker, sink, err_tx)?,
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };
        stream.play()?;

        // The stream stops when it is dropped on return.
        crossbeam_channel::select! {
            recv(cancel.receiver()) -> _ => Ok(()),
            recv(err_rx) -> err => match err {
                Ok(err) => Err(CaptureError::Stream(err)),
                Err(_) => Ok(()),
            },
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut conformer: Conformer,
    mut chunker: FrameChunker,
    sink: Arc<dyn FrameSink>,
    errors: Sender<cpal::StreamError>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
            let samples = if conformer.is_passthrough() {
                &scratch[..]
            } else {
                conformer.convert(&scratch)
            };
            chunker.push(samples, |frame| sink.process(frame));
        },
        move |err| {
            log::error!("Audio input error: {}", err);
            let _ = errors.try_send(err);
        },
        None,
    )
}
