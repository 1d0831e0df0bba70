//! Microphone input with cpal.
//!
//! The device is opened at its native format; samples are reduced to mono and
//! resampled to 16 kHz inside the audio callback before being handed to the
//! session through an unbounded channel.

use super::AudioError;
use asc_live_core::audio_utils;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, Stream, StreamConfig};
use rubato::{FastFixedIn, Resampler};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Resampler input block, 20ms at 48 kHz.
const RESAMPLE_CHUNK: usize = 960;

/// An open microphone stream. Dropping it releases the device.
pub struct Microphone {
    _stream: Stream,
    device_name: String,
}

impl Microphone {
    /// Opens the named input device, or the default one, and starts capturing.
    pub fn open(
        device_name: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<f32>>), AudioError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| AudioError::Stream(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))?,
            None => host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?,
        };
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                AudioError::PermissionDenied(e.to_string())
            }
            cpal::DefaultStreamConfigError::BackendSpecific { .. } => {
                AudioError::PermissionDenied(e.to_string())
            }
            other => AudioError::Stream(other.to_string()),
        })?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();

        info!(
            device = %name,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "Opening microphone"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, tx)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, tx)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, tx)?,
            other => {
                return Err(AudioError::Stream(format!(
                    "Unsupported sample format {other:?}"
                )));
            }
        };
        stream
            .play()
            .map_err(|e| AudioError::Stream(format!("Failed to start stream: {e}")))?;

        Ok((
            Self {
                _stream: stream,
                device_name: name,
            },
            rx,
        ))
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        info!(device = %self.device_name, "Microphone released");
    }
}

/// Names of the input devices on the default host.
pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::Stream(format!("Failed to enumerate devices: {e}")))?;
    Ok(devices
        .enumerate()
        .map(|(index, d)| d.name().unwrap_or_else(|_| format!("Unknown Device {index}")))
        .collect())
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut resampler = MonoResampler::new(config.sample_rate.0)?;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let interleaved = to_f32(data);
                let mono = audio_utils::downmix_to_mono(&interleaved, channels);
                let samples = resampler.process(&mono);
                if !samples.is_empty() {
                    // The receiver is gone once the session stops; nothing to do.
                    let _ = tx.send(samples);
                }
            },
            |err| error!(error = %err, "Microphone stream error"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::PermissionDenied(e.to_string())
            }
            cpal::BuildStreamError::BackendSpecific { .. } => {
                AudioError::PermissionDenied(e.to_string())
            }
            other => AudioError::Stream(format!("Failed to build stream: {other}")),
        })
}

/// Device samples in any supported format as f32 in [-1, 1].
fn to_f32<T>(data: &[T]) -> Vec<f32>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    data.iter().map(|&s| f32::from_sample(s)).collect()
}

/// Converts device-rate mono audio to the 16 kHz wire rate.
struct MonoResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl MonoResampler {
    fn new(device_rate: u32) -> Result<Self, AudioError> {
        let inner = if device_rate == audio_utils::INPUT_SAMPLE_RATE {
            None
        } else {
            Some(
                audio_utils::create_resampler(
                    device_rate as f64,
                    audio_utils::INPUT_SAMPLE_RATE as f64,
                    RESAMPLE_CHUNK,
                )
                .map_err(|e| AudioError::Stream(format!("Failed to create resampler: {e}")))?,
            )
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    fn process(&mut self, mono: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return mono.to_vec();
        };
        self.pending.extend_from_slice(mono);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(resampled) => out.extend_from_slice(&resampled[0]),
                Err(e) => error!(error = %e, "Resampling error"),
            }
        }
        out
    }
}
