//! cpal adapters for the microphone and the speaker.

pub mod microphone;
pub mod speaker;

use asc_live_core::SessionError;

pub use microphone::{Microphone, list_input_devices};
pub use speaker::CpalOutput;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,
    #[error("No output device available")]
    NoOutputDevice,
    #[error("Input device '{0}' not found")]
    DeviceNotFound(String),
    #[error("Access to the audio device was refused: {0}")]
    PermissionDenied(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Any failure to open the microphone ends the start attempt as a permission failure.
impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        SessionError::permission_denied(err.to_string())
    }
}
