use anyhow::{Context, Result};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded audio, interleaved in its native channel layout.
pub struct AudioData {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

pub fn decode_audio(path: &Path) -> Result<AudioData> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Failed to probe audio format")?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio tracks found")?;

    let track_id = track.id;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());
    let sample_rate = track.codec_params.sample_rate.context("Unknown sample rate")?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Failed to create audio decoder")?;

    let mut samples: Vec<f32> = Vec::new();
    let mut buf: Option<SampleBuffer<f32>> = None;
    let mut skipped = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("Failed to read audio packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(Error::DecodeError(_)) => {
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e).context("Failed to decode audio packet"),
        };

        // Packets rarely grow, so the interleave buffer is reused until one does.
        let spec = *decoded.spec();
        let needed = decoded.capacity() * spec.channels.count();
        if buf.as_ref().map_or(true, |b| b.capacity() < needed) {
            buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        let Some(sample_buf) = buf.as_mut() else {
            continue;
        };
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if skipped > 0 {
        log::warn!("Skipped {} undecodable packets in {}", skipped, path.display());
    }
    log::info!(
        "Decoded {}: {} frames, {} channels, {}Hz",
        path.display(),
        samples.len() / channels.max(1),
        channels,
        sample_rate
    );

    Ok(AudioData {
        samples,
        channels,
        sample_rate,
    })
}

/// Remap interleaved audio to `channels` channels. Mono is duplicated;
/// surplus channels are dropped.
pub fn remap_channels(samples: &[f32], from: usize, channels: usize) -> Vec<f32> {
    if from == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(samples.len() / from * channels);
    for frame in samples.chunks_exact(from) {
        for ch in 0..channels {
            out.push(frame[ch.min(from - 1)]);
        }
    }
    out
}

/// Nearest-sample rate conversion of interleaved audio.
pub fn resample_nearest(samples: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || channels == 0 || from_rate == 0 {
        return samples.to_vec();
    }
    let in_frames = samples.len() / channels;
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let src = ((i as u64 * from_rate as u64 / to_rate as u64) as usize).min(in_frames - 1);
        out.extend_from_slice(&samples[src * channels..(src + 1) * channels]);
    }
    out
}
