//! Frames microphone samples into fixed-size PCM16 chunks ready for the wire.

use crate::{
    audio_utils::{self, INPUT_MIME_TYPE},
    volume::VolumeAnalyser,
};
use tracing::warn;

/// One outbound chunk of captured audio, already transport encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Position in capture order, starting at 0 for each pipeline.
    pub seq: u64,
    /// Base64 encoded PCM16LE mono at 16 kHz.
    pub data: String,
    pub mime_type: &'static str,
    /// Mean analyser bin magnitude, 0.0..=255.0.
    pub volume: f32,
    /// Samples that were outside [-1, 1] and had to be clamped.
    pub clipped: usize,
}

/// Accumulates mono 16 kHz samples and cuts them into `frame_len` frames.
///
/// Less than one frame is ever held between calls to [`CapturePipeline::push`].
pub struct CapturePipeline {
    frame_len: usize,
    pending: Vec<f32>,
    next_seq: u64,
    analyser: VolumeAnalyser,
}

impl CapturePipeline {
    /// # Panics
    ///
    /// Panics if `frame_len` is zero.
    pub fn new(frame_len: usize) -> Self {
        assert!(frame_len > 0, "frame length must be non-zero");
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
            next_seq: 0,
            analyser: VolumeAnalyser::new(),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Appends samples and returns every frame completed by them, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<CapturedFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_len {
                frames.push(self.encode_pending());
            }
        }
        frames
    }

    /// Drops any partially filled frame and the analyser history.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.analyser.reset();
    }

    fn encode_pending(&mut self) -> CapturedFrame {
        let volume = self.analyser.level(&self.pending);
        let (pcm16, clipped) = audio_utils::encode_f32_to_i16(&self.pending);
        if clipped > 0 {
            warn!(
                seq = self.next_seq,
                clipped, "Captured samples outside [-1, 1] were clamped"
            );
        }
        self.pending.clear();

        let seq = self.next_seq;
        self.next_seq += 1;
        CapturedFrame {
            seq,
            data: audio_utils::encode_i16(&pcm16),
            mime_type: INPUT_MIME_TYPE,
            volume,
            clipped,
        }
    }
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new(audio_utils::CAPTURE_FRAME_LEN)
    }
}
