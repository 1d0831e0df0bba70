//! The live session state machine.
//!
//! A [`Session`] holds no I/O handles of its own. The runtime feeds it one event at
//! a time (connection opened, frame captured, server message, playback tick,
//! close) and acts on what it returns. Every state change is published as a
//! [`SessionSnapshot`] on a watch channel.

use crate::{
    audio_utils::{self, OUTPUT_SAMPLE_RATE},
    capture::CapturedFrame,
    error::{DecodeError, ProtocolError, SessionError},
    playback::{AudioBuffer, AudioOutput, BufferId, PlaybackScheduler, ScheduledBuffer},
    transcript::{Role, Transcript, TranscriptEntry},
};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Listening,
    Speaking,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Listening => "listening",
            SessionStatus::Speaking => "speaking",
        }
    }

    /// True while the remote connection is up.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Listening | SessionStatus::Speaking)
    }
}

/// What the UI layer renders.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub transcript: Vec<TranscriptEntry>,
    pub volume_level: f32,
}

/// Provider-neutral content of one inbound server message.
///
/// A single message may carry any combination of these signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEvent {
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    pub interrupted: bool,
    /// Base64 PCM16LE payloads at the playback rate, in arrival order.
    pub audio: Vec<String>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Frames captured while connecting that are kept for sending once open.
    pub pending_frame_capacity: usize,
    pub output_sample_rate: u32,
    pub output_channels: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pending_frame_capacity: 32,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            output_channels: 1,
        }
    }
}

/// What handling one server message did to playback.
#[derive(Debug, Default)]
pub struct InboundOutcome {
    pub flushed: Vec<BufferId>,
    pub scheduled: Vec<ScheduledBuffer>,
    pub dropped_payloads: usize,
}

pub struct Session<O> {
    status: SessionStatus,
    transcript: Transcript,
    scheduler: PlaybackScheduler<O>,
    pending: VecDeque<CapturedFrame>,
    options: SessionOptions,
    volume_level: f32,
    next_payload_seq: u64,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl<O: AudioOutput> Session<O> {
    pub fn new(output: O, options: SessionOptions) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            status: SessionStatus::Idle,
            transcript: Transcript::default(),
            scheduler: PlaybackScheduler::new(output),
            pending: VecDeque::with_capacity(options.pending_frame_capacity),
            options,
            volume_level: 0.0,
            next_payload_seq: 0,
            snapshot_tx,
        }
    }

    /// Observable stream of snapshots, starting with the current one.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn volume_level(&self) -> f32 {
        self.volume_level
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<O> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut PlaybackScheduler<O> {
        &mut self.scheduler
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            transcript: self.transcript.entries().to_vec(),
            volume_level: self.volume_level,
        }
    }

    /// Idle -> Connecting. A second start while a session is live is refused.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Idle {
            return Err(SessionError::AlreadyActive);
        }
        self.transcript.clear();
        self.pending.clear();
        self.next_payload_seq = 0;
        self.transition(SessionStatus::Connecting);
        Ok(())
    }

    /// Connecting -> Listening. Returns the frames captured while connecting,
    /// oldest first, for the caller to send before anything newer.
    pub fn on_open(&mut self) -> Vec<CapturedFrame> {
        if self.status != SessionStatus::Connecting {
            warn!(state = self.status.as_str(), "Ignoring open outside of connecting");
            return Vec::new();
        }
        self.transition(SessionStatus::Listening);
        let flushed: Vec<CapturedFrame> = self.pending.drain(..).collect();
        if !flushed.is_empty() {
            debug!(frames = flushed.len(), "Flushing frames captured while connecting");
        }
        flushed
    }

    /// Returns the frame if it should be sent now.
    pub fn on_capture_frame(&mut self, frame: CapturedFrame) -> Option<CapturedFrame> {
        match self.status {
            SessionStatus::Idle => None,
            SessionStatus::Connecting => {
                self.set_volume(frame.volume);
                if self.pending.len() >= self.options.pending_frame_capacity {
                    if let Some(dropped) = self.pending.pop_front() {
                        warn!(seq = dropped.seq, "Pending frame queue full, dropping oldest frame");
                    }
                }
                if self.options.pending_frame_capacity > 0 {
                    self.pending.push_back(frame);
                }
                None
            }
            SessionStatus::Listening | SessionStatus::Speaking => {
                self.set_volume(frame.volume);
                Some(frame)
            }
        }
    }

    /// Applies every signal carried by one server message.
    pub fn on_server_event(&mut self, event: ServerEvent) -> Result<InboundOutcome, ProtocolError> {
        if !self.status.is_open() {
            return Err(ProtocolError::UnexpectedMessage {
                what: "server content",
                state: self.status.as_str(),
            });
        }

        let mut outcome = InboundOutcome::default();
        let mut transcript_changed = false;

        if let Some(text) = event.output_transcript {
            self.transcript.push(Role::Model, text);
            transcript_changed = true;
        }
        if let Some(text) = event.input_transcript {
            self.transcript.push(Role::User, text);
            transcript_changed = true;
        }

        if event.interrupted {
            outcome.flushed = self.scheduler.flush();
            info!(stopped = outcome.flushed.len(), "Model interrupted, playback flushed");
            if self.status == SessionStatus::Speaking {
                self.transition(SessionStatus::Listening);
            }
        }

        for payload in &event.audio {
            let seq = self.next_payload_seq;
            self.next_payload_seq += 1;
            match self.decode_payload(payload, seq) {
                Ok(buffer) => {
                    outcome.scheduled.push(self.scheduler.schedule(buffer));
                    if self.status != SessionStatus::Speaking {
                        self.transition(SessionStatus::Speaking);
                    }
                }
                Err(e) => {
                    warn!(seq, error = %e, "Dropping undecodable model audio");
                    outcome.dropped_payloads += 1;
                }
            }
        }

        if event.turn_complete {
            debug!("Model turn complete");
        }
        if transcript_changed {
            self.publish();
        }
        Ok(outcome)
    }

    /// Reaps buffers that finished playing by the output clock.
    pub fn on_tick(&mut self) -> Vec<BufferId> {
        let finished = self.scheduler.reap();
        self.after_playback_progress();
        finished
    }

    /// Explicit completion notice from the output engine.
    pub fn on_playback_complete(&mut self, id: BufferId) -> bool {
        let removed = self.scheduler.complete(id);
        self.after_playback_progress();
        removed
    }

    pub fn on_connect_failed(&mut self, error: &SessionError) {
        warn!(error = %error, "Connection attempt failed");
        self.teardown();
    }

    pub fn on_remote_closed(&mut self, reason: &str) {
        info!(reason, "Remote closed the session");
        self.teardown();
    }

    pub fn on_transport_error(&mut self, error: &str) {
        warn!(error, "Transport error, ending session");
        self.teardown();
    }

    /// Ends the session from any state. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.status == SessionStatus::Idle && self.scheduler.is_drained() {
            return;
        }
        info!("Stopping session");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.scheduler.flush();
        self.pending.clear();
        self.volume_level = 0.0;
        self.transition(SessionStatus::Idle);
    }

    fn after_playback_progress(&mut self) {
        if self.status == SessionStatus::Speaking && self.scheduler.is_drained() {
            self.transition(SessionStatus::Listening);
        }
    }

    fn decode_payload(&self, payload: &str, seq: u64) -> Result<AudioBuffer, DecodeError> {
        let samples = audio_utils::decode_base64_pcm16(payload)?;
        let channels = audio_utils::deinterleave_i16_to_f32(&samples, self.options.output_channels)?;
        Ok(AudioBuffer {
            channels,
            sample_rate: self.options.output_sample_rate,
            seq,
        })
    }

    fn set_volume(&mut self, level: f32) {
        if self.volume_level != level {
            self.volume_level = level;
            self.publish();
        }
    }

    fn transition(&mut self, next: SessionStatus) {
        if self.status != next {
            debug!(from = self.status.as_str(), to = next.as_str(), "Session status change");
        }
        self.status = next;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedOutput, pcm_payload};
    use approx::assert_abs_diff_eq;

    fn session() -> Session<SimulatedOutput> {
        Session::new(SimulatedOutput::default(), SessionOptions::default())
    }

    fn open_session() -> Session<SimulatedOutput> {
        let mut session = session();
        session.start().unwrap();
        session.on_open();
        session
    }

    fn frame(seq: u64) -> CapturedFrame {
        CapturedFrame {
            seq,
            data: audio_utils::encode_i16(&[seq as i16]),
            mime_type: audio_utils::INPUT_MIME_TYPE,
            volume: 10.0,
            clipped: 0,
        }
    }

    fn audio(seconds: &[f64]) -> ServerEvent {
        ServerEvent {
            audio: seconds.iter().map(|&s| pcm_payload(s)).collect(),
            ..Default::default()
        }
    }

    fn set_clock(session: &mut Session<SimulatedOutput>, now: f64) {
        session.scheduler_mut().output_mut().now = now;
    }

    #[test]
    fn full_lifecycle_walks_every_state() {
        let mut session = session();
        assert_eq!(session.status(), SessionStatus::Idle);

        session.start().unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);

        session.on_open();
        assert_eq!(session.status(), SessionStatus::Listening);

        session.on_server_event(audio(&[0.2])).unwrap();
        assert_eq!(session.status(), SessionStatus::Speaking);

        set_clock(&mut session, 0.2);
        session.on_tick();
        assert_eq!(session.status(), SessionStatus::Listening);

        session.stop();
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn connect_failure_returns_to_idle() {
        let mut session = session();
        session.start().unwrap();
        session.on_capture_frame(frame(0));

        session.on_connect_failed(&SessionError::connection("handshake refused"));
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.pending_len(), 0);

        // A fresh attempt starts clean
        session.start().unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);
    }

    #[test]
    fn double_start_is_refused() {
        let mut session = session();
        session.start().unwrap();
        assert!(matches!(session.start(), Err(SessionError::AlreadyActive)));
        session.on_open();
        assert!(matches!(session.start(), Err(SessionError::AlreadyActive)));
        assert_eq!(session.status(), SessionStatus::Listening);
    }

    #[test]
    fn stop_is_idempotent_from_any_state() {
        let mut session = session();
        session.stop();
        assert_eq!(session.status(), SessionStatus::Idle);

        session.start().unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.status(), SessionStatus::Idle);

        let mut session = open_session();
        session.on_server_event(audio(&[0.5, 0.5])).unwrap();
        session.stop();
        assert_eq!(session.scheduler().active_len(), 0);
        assert_eq!(session.scheduler().output().stopped.len(), 2);
        session.stop();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.scheduler().output().stopped.len(), 2);
    }

    #[test]
    fn frames_captured_while_connecting_are_flushed_in_order() {
        let mut session = session();
        assert!(session.on_capture_frame(frame(0)).is_none());
        assert_eq!(session.pending_len(), 0);

        session.start().unwrap();
        for seq in 1..=3 {
            assert!(session.on_capture_frame(frame(seq)).is_none());
        }
        let flushed = session.on_open();
        assert_eq!(flushed.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        let sent = session.on_capture_frame(frame(4)).unwrap();
        assert_eq!(sent.seq, 4);
        assert_eq!(session.volume_level(), 10.0);
    }

    #[test]
    fn pending_queue_is_bounded_and_drops_oldest() {
        let mut session = Session::new(
            SimulatedOutput::default(),
            SessionOptions {
                pending_frame_capacity: 2,
                ..Default::default()
            },
        );
        session.start().unwrap();
        for seq in 0..5 {
            session.on_capture_frame(frame(seq));
        }
        let flushed = session.on_open();
        assert_eq!(flushed.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn three_payloads_schedule_gaplessly_and_drain_at_end() {
        let mut session = open_session();
        let outcome = session.on_server_event(audio(&[0.5, 0.3, 0.4])).unwrap();
        let starts: Vec<f64> = outcome.scheduled.iter().map(|s| s.start).collect();

        assert_eq!(starts.len(), 3);
        assert_abs_diff_eq!(starts[0], 0.0);
        assert_abs_diff_eq!(starts[1], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(starts[2], 0.8, epsilon = 1e-9);
        assert_eq!(session.status(), SessionStatus::Speaking);

        set_clock(&mut session, 0.9);
        assert_eq!(session.on_tick().len(), 2);
        assert_eq!(session.status(), SessionStatus::Speaking);

        set_clock(&mut session, 1.19);
        session.on_tick();
        assert_eq!(session.status(), SessionStatus::Speaking);

        set_clock(&mut session, 1.2);
        session.on_tick();
        assert_eq!(session.status(), SessionStatus::Listening);
    }

    #[test]
    fn payloads_in_separate_messages_never_overlap() {
        let mut session = open_session();
        let mut schedule = Vec::new();
        for (i, seconds) in [0.25, 0.1, 0.6, 0.05, 0.3].iter().enumerate() {
            set_clock(&mut session, i as f64 * 0.02);
            let outcome = session.on_server_event(audio(&[*seconds])).unwrap();
            schedule.extend(outcome.scheduled);
        }
        for pair in schedule.windows(2) {
            assert!(pair[1].start >= pair[0].end() - 1e-12);
            assert_abs_diff_eq!(pair[1].start, pair[0].end(), epsilon = 1e-9);
        }
    }

    #[test]
    fn interruption_flushes_queue_and_resets_cursor() {
        let mut session = open_session();
        session.on_server_event(audio(&[0.5, 0.5])).unwrap();
        assert_eq!(session.scheduler().active_len(), 2);
        assert_abs_diff_eq!(session.scheduler().cursor(), 1.0, epsilon = 1e-9);

        set_clock(&mut session, 0.3);
        let outcome = session
            .on_server_event(ServerEvent {
                interrupted: true,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(outcome.flushed.len(), 2);
        assert_eq!(session.scheduler().output().stopped, outcome.flushed);
        assert_eq!(session.scheduler().active_len(), 0);
        assert_eq!(session.scheduler().cursor(), 0.0);
        assert_eq!(session.status(), SessionStatus::Listening);

        // Next reply starts now, not at the stale projected offset of 1.0
        let outcome = session.on_server_event(audio(&[0.2])).unwrap();
        assert_abs_diff_eq!(outcome.scheduled[0].start, 0.3);
    }

    #[test]
    fn interruption_keeps_the_transcript() {
        let mut session = open_session();
        session
            .on_server_event(ServerEvent {
                output_transcript: Some("Photosynthesis turns".into()),
                audio: vec![pcm_payload(0.4)],
                ..Default::default()
            })
            .unwrap();
        session
            .on_server_event(ServerEvent {
                input_transcript: Some("wait".into()),
                interrupted: true,
                ..Default::default()
            })
            .unwrap();

        let entries = session.transcript().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, Role::Model);
        assert_eq!(entries[1].role, Role::User);
        assert_eq!(entries[1].text, "wait");
    }

    #[test]
    fn one_message_can_carry_every_signal() {
        let mut session = open_session();
        session.on_server_event(audio(&[1.0])).unwrap();

        set_clock(&mut session, 0.1);
        let outcome = session
            .on_server_event(ServerEvent {
                input_transcript: Some("hold on".into()),
                output_transcript: Some("So the".into()),
                interrupted: true,
                audio: vec![pcm_payload(0.2)],
                turn_complete: false,
            })
            .unwrap();

        assert_eq!(outcome.flushed.len(), 1);
        assert_eq!(outcome.scheduled.len(), 1);
        assert_abs_diff_eq!(outcome.scheduled[0].start, 0.1);
        assert_eq!(session.transcript().len(), 2);
        assert_eq!(session.status(), SessionStatus::Speaking);
    }

    #[test]
    fn undecodable_audio_is_dropped_without_ending_the_session() {
        let mut session = open_session();
        let outcome = session
            .on_server_event(ServerEvent {
                audio: vec!["%%%".into(), pcm_payload(0.1), String::new()],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(outcome.dropped_payloads, 2);
        assert_eq!(outcome.scheduled.len(), 1);
        assert_eq!(session.status(), SessionStatus::Speaking);
    }

    #[test]
    fn content_outside_an_open_session_is_a_protocol_error() {
        let mut session = session();
        let err = session.on_server_event(audio(&[0.1])).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedMessage {
                what: "server content",
                state: "idle"
            }
        );

        session.start().unwrap();
        assert!(session.on_server_event(audio(&[0.1])).is_err());
        assert_eq!(session.scheduler().active_len(), 0);
    }

    #[test]
    fn remote_close_and_transport_error_tear_down() {
        let mut session = open_session();
        session.on_server_event(audio(&[0.3])).unwrap();
        session.on_remote_closed("going away");
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.scheduler().is_drained());

        let mut session = open_session();
        session.on_transport_error("connection reset");
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn explicit_completion_drains_like_a_tick() {
        let mut session = open_session();
        let outcome = session.on_server_event(audio(&[0.1, 0.1])).unwrap();
        assert!(session.on_playback_complete(outcome.scheduled[0].id));
        assert_eq!(session.status(), SessionStatus::Speaking);
        assert!(session.on_playback_complete(outcome.scheduled[1].id));
        assert!(!session.on_playback_complete(outcome.scheduled[1].id));
        assert_eq!(session.status(), SessionStatus::Listening);
    }

    #[test]
    fn multi_channel_payloads_are_deinterleaved() {
        let mut session = Session::new(
            SimulatedOutput::default(),
            SessionOptions {
                output_channels: 2,
                ..Default::default()
            },
        );
        session.start().unwrap();
        session.on_open();
        // 24000 interleaved samples = 12000 frames = 0.5s of stereo
        let payload = audio_utils::encode_i16(&vec![0; 24000]);
        let outcome = session
            .on_server_event(ServerEvent {
                audio: vec![payload],
                ..Default::default()
            })
            .unwrap();
        assert_abs_diff_eq!(outcome.scheduled[0].duration, 0.5);
    }

    #[tokio::test]
    async fn snapshots_track_status_and_transcript() {
        let mut session = session();
        let mut rx = session.subscribe();
        assert_eq!(rx.borrow_and_update().status, SessionStatus::Idle);

        session.start().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, SessionStatus::Connecting);

        session.on_open();
        session
            .on_server_event(ServerEvent {
                input_transcript: Some("quiz me".into()),
                ..Default::default()
            })
            .unwrap();
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.status, SessionStatus::Listening);
        assert_eq!(snapshot.transcript[0].text, "quiz me");

        session.stop();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.transcript.len(), 1);
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap()["volumeLevel"],
            serde_json::json!(0.0)
        );
    }

    #[test]
    fn new_session_clears_the_previous_transcript() {
        let mut session = open_session();
        session
            .on_server_event(ServerEvent {
                output_transcript: Some("hello".into()),
                ..Default::default()
            })
            .unwrap();
        session.stop();
        assert_eq!(session.transcript().len(), 1);

        session.start().unwrap();
        assert!(session.transcript().is_empty());
    }
}
