//! Live Study Assistant Service
//!
//! Wires the realtime session core to the host: cpal devices for the
//! microphone and speaker, the Gemini Live WebSocket client, configuration
//! from the environment, and a terminal renderer for the session state.
//! The `asc-live` binary is a thin wrapper around this library.

pub mod audio;
pub mod config;
pub mod render;
pub mod runner;
