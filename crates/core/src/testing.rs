//! Test doubles shared by the unit tests of this crate.

use crate::{
    audio_utils::{self, OUTPUT_SAMPLE_RATE},
    playback::{AudioBuffer, AudioOutput, BufferId},
};

/// An output engine whose clock only moves when a test sets `now`.
#[derive(Debug, Default)]
pub struct SimulatedOutput {
    pub now: f64,
    pub played: Vec<(BufferId, f64)>,
    pub stopped: Vec<BufferId>,
}

impl AudioOutput for SimulatedOutput {
    fn current_time(&self) -> f64 {
        self.now
    }

    fn play(&mut self, id: BufferId, _buffer: &AudioBuffer, start_at: f64) {
        self.played.push((id, start_at));
    }

    fn stop(&mut self, id: BufferId) {
        self.stopped.push(id);
    }
}

fn frames_for(seconds: f64) -> usize {
    (seconds * OUTPUT_SAMPLE_RATE as f64).round() as usize
}

/// A silent mono buffer of the given length at the playback rate.
pub fn tone(seconds: f64) -> AudioBuffer {
    AudioBuffer {
        channels: vec![vec![0.0; frames_for(seconds)]],
        sample_rate: OUTPUT_SAMPLE_RATE,
        seq: 0,
    }
}

/// A base64 PCM16 payload of the given length, as the model would send it.
pub fn pcm_payload(seconds: f64) -> String {
    audio_utils::encode_i16(&vec![64; frames_for(seconds)])
}
