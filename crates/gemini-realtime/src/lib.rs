//! Minimal client for the Gemini Live bidirectional audio API.

pub mod client;
pub mod types;

pub use client::{LiveConfig, LiveError, LiveEvent, LiveReceiver, LiveSender, connect};
