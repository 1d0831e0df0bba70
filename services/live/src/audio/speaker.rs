//! Speaker output with cpal.
//!
//! The output callback advances a frame counter that serves as the playback
//! clock and mixes every scheduled buffer at its start frame. Buffers that do
//! not match the device rate are resampled when they are queued.

use super::AudioError;
use asc_live_core::{AudioBuffer, AudioOutput, BufferId, audio_utils};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample, Stream, StreamConfig};
use rubato::Resampler;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

const RESAMPLE_CHUNK: usize = 1024;

struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// State shared between the session and the audio callback.
#[derive(Default)]
struct Mixer {
    clock_frames: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    /// Renders `frames` frames into `out` and advances the clock.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let frames = out.len() / channels.max(1);
        for frame in 0..frames {
            let t = self.clock_frames + frame as u64;
            let mut value = 0.0;
            for voice in &self.voices {
                if t >= voice.start_frame && t < voice.end_frame() {
                    value += voice.samples[(t - voice.start_frame) as usize];
                }
            }
            let value = value.clamp(-1.0, 1.0);
            for sample in &mut out[frame * channels..(frame + 1) * channels] {
                *sample = value;
            }
        }
        self.clock_frames += frames as u64;
        let now = self.clock_frames;
        self.voices.retain(|voice| voice.end_frame() > now);
    }
}

pub struct CpalOutput {
    _stream: Stream,
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
}

impl CpalOutput {
    /// Opens the default output device and starts its clock.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "Opening speaker output"
        );

        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer.clone())?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer.clone())?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer.clone())?,
            other => {
                return Err(AudioError::Stream(format!(
                    "Unsupported sample format {other:?}"
                )));
            }
        };
        stream
            .play()
            .map_err(|e| AudioError::Stream(format!("Failed to start stream: {e}")))?;

        Ok(Self {
            _stream: stream,
            mixer,
            sample_rate: config.sample_rate.0,
        })
    }

    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.mixer().clock_frames as f64 / self.sample_rate as f64
    }

    fn play(&mut self, id: BufferId, buffer: &AudioBuffer, start_at: f64) {
        let samples = to_device_rate(buffer, self.sample_rate);
        let start_frame = (start_at * self.sample_rate as f64).round() as u64;
        self.mixer().voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    fn stop(&mut self, id: BufferId) {
        self.mixer().voices.retain(|voice| voice.id != id);
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.clear();
                scratch.resize(data.len(), 0.0);
                mixer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .render(&mut scratch, channels);
                for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(value);
                }
            },
            |err| error!(error = %err, "Speaker stream error"),
            None,
        )
        .map_err(|e| AudioError::Stream(format!("Failed to build stream: {e}")))
}

/// Mono samples of `buffer` at `device_rate`.
fn to_device_rate(buffer: &AudioBuffer, device_rate: u32) -> Vec<f32> {
    let mono = buffer.channels.first().cloned().unwrap_or_default();
    if buffer.sample_rate == device_rate || mono.is_empty() {
        return mono;
    }

    let mut resampler = match audio_utils::create_resampler(
        buffer.sample_rate as f64,
        device_rate as f64,
        RESAMPLE_CHUNK,
    ) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!(error = %e, "Cannot resample model audio, playing at source rate");
            return mono;
        }
    };

    let expected =
        (mono.len() as f64 * device_rate as f64 / buffer.sample_rate as f64).round() as usize;
    let mut out = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    let mut rest = mono.as_slice();
    while out.len() < expected {
        let needed = resampler.input_frames_next();
        let mut chunk = rest[..needed.min(rest.len())].to_vec();
        rest = &rest[chunk.len()..];
        // Zero padding flushes the tail and the resampler delay
        chunk.resize(needed, 0.0);
        match resampler.process(&[chunk], None) {
            Ok(resampled) => out.extend_from_slice(&resampled[0]),
            Err(e) => {
                error!(error = %e, "Resampling error");
                break;
            }
        }
    }
    out.truncate(expected);
    out
}
