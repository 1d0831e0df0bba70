//! Core of the ASC live assistant: everything about a realtime voice session
//! that can be expressed without touching audio hardware or the network.
//!
//! - `capture` frames microphone samples into wire-ready PCM16 chunks.
//! - `playback` schedules decoded model audio gaplessly against an output clock.
//! - `session` is the state machine tying both to the remote protocol.

pub mod audio_utils;
pub mod capture;
pub mod error;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod volume;

#[cfg(test)]
mod testing;

pub use capture::{CapturePipeline, CapturedFrame};
pub use error::{DecodeError, ProtocolError, SessionError};
pub use playback::{AudioBuffer, AudioOutput, BufferId, PlaybackScheduler, ScheduledBuffer};
pub use session::{
    InboundOutcome, ServerEvent, Session, SessionOptions, SessionSnapshot, SessionStatus,
};
pub use transcript::{Role, Transcript, TranscriptEntry};
