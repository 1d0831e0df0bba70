//! Error taxonomy for a live session.
//!
//! `SessionError` variants are fatal: the session is torn down before they reach
//! the caller. `ProtocolError` and `DecodeError` are absorbed by the session and
//! only logged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out after {0:?} waiting for the remote model to accept the session")]
    ConnectTimeout(std::time::Duration),

    #[error("A session is already active")]
    AlreadyActive,
}

impl SessionError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    pub fn permission_denied<S: Into<String>>(msg: S) -> Self {
        Self::PermissionDenied(msg.into())
    }
}

/// An inbound message that does not fit the current session state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Received {what} while the session is {state}")]
    UnexpectedMessage {
        what: &'static str,
        state: &'static str,
    },

    #[error("Malformed server message: {0}")]
    Malformed(String),
}

/// A model audio payload that cannot be turned into samples.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Audio payload is empty")]
    Empty,

    #[error("Audio payload has an odd byte count ({0}), PCM16 needs 2 bytes per sample")]
    OddByteCount(usize),

    #[error("Audio payload must declare at least one channel")]
    NoChannels,

    #[error("{samples} samples cannot be split evenly into {channels} channels")]
    PartialFrame { samples: usize, channels: usize },
}
