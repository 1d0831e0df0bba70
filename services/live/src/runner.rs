//! Drives one live session against the real world.
//!
//! [`LiveAssistant`] owns the session state machine and feeds it from three
//! sources: microphone samples, events from the Gemini socket, and a playback
//! tick that reaps finished buffers by the output clock. Outbound audio goes
//! through a dedicated writer task so a slow socket never stalls capture.

use crate::audio::Microphone;
use crate::config::Config;
use asc_live_core::{
    AudioOutput, CapturePipeline, CapturedFrame, ProtocolError, Session, SessionError,
    SessionSnapshot,
};
use gemini_realtime::{LiveError, LiveEvent, LiveReceiver, LiveSender};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How often finished buffers are reaped from the playback schedule.
const PLAYBACK_TICK: Duration = Duration::from_millis(20);
/// How long the writer gets to flush and close the socket on stop.
const WRITER_SHUTDOWN: Duration = Duration::from_secs(2);

pub struct LiveAssistant<O: AudioOutput> {
    session: Session<O>,
    config: Config,
    pipeline: CapturePipeline,
    microphone: Option<Microphone>,
    samples_rx: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    outbound_tx: Option<mpsc::UnboundedSender<CapturedFrame>>,
    writer: Option<JoinHandle<Result<(), LiveError>>>,
    receiver: Option<LiveReceiver>,
}

impl<O: AudioOutput> LiveAssistant<O> {
    pub fn new(config: Config, output: O) -> Self {
        let session = Session::new(output, config.session_options());
        Self {
            session,
            config,
            pipeline: CapturePipeline::default(),
            microphone: None,
            samples_rx: None,
            outbound_tx: None,
            writer: None,
            receiver: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &Session<O> {
        &self.session
    }

    /// Opens the microphone, then connects. On failure the session is back
    /// to idle and every acquired resource has been released.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        self.session.start()?;
        match Microphone::open(self.config.input_device.as_deref()) {
            Ok((microphone, samples)) => {
                info!(device = %microphone.device_name(), "Microphone open");
                self.microphone = Some(microphone);
                self.samples_rx = Some(samples);
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.session.on_connect_failed(&err);
                return Err(err);
            }
        }
        self.connect().await
    }

    /// Like [`start`](Self::start), with samples fed from an already open
    /// source instead of the microphone.
    pub async fn start_with_input(
        &mut self,
        samples: mpsc::UnboundedReceiver<Vec<f32>>,
    ) -> Result<(), SessionError> {
        self.session.start()?;
        self.samples_rx = Some(samples);
        self.connect().await
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let live_config = self.config.live_config();
        let connect_timeout = self.config.connect_timeout;
        info!(model = %live_config.model, ?connect_timeout, "Connecting to Gemini Live");

        let connecting = gemini_realtime::connect(&live_config);
        let deadline = tokio::time::sleep(connect_timeout);
        tokio::pin!(connecting, deadline);

        // Capture keeps running while the handshake is in flight.
        let result = loop {
            tokio::select! {
                result = &mut connecting => {
                    break result.map_err(|e| SessionError::connection(e.to_string()));
                }
                _ = &mut deadline => break Err(SessionError::ConnectTimeout(connect_timeout)),
                Some(samples) = recv_samples(&mut self.samples_rx) => self.capture(&samples),
            }
        };

        let (sender, receiver) = match result {
            Ok(halves) => halves,
            Err(err) => {
                self.session.on_connect_failed(&err);
                self.release_input();
                return Err(err);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.writer = Some(tokio::spawn(
            write_frames(sender, outbound_rx).instrument(info_span!("live_writer")),
        ));
        self.outbound_tx = Some(outbound_tx);
        self.receiver = Some(receiver);

        for frame in self.session.on_open() {
            self.forward(frame);
        }
        info!("Session open, listening");
        Ok(())
    }

    /// Runs the session until the remote side ends it, the transport fails,
    /// or `shutdown` resolves. The session is stopped on return.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(PLAYBACK_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            if !self.session.status().is_open() {
                break Ok(());
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                samples = recv_samples(&mut self.samples_rx) => match samples {
                    Some(samples) => self.capture(&samples),
                    None => {
                        warn!("Microphone stream ended");
                        self.samples_rx = None;
                    }
                },
                event = next_event(&mut self.receiver) => match event {
                    None => {
                        self.session.on_remote_closed("stream ended");
                        break Ok(());
                    }
                    Some(Ok(LiveEvent::Content(content))) => {
                        match self.session.on_server_event(content.into()) {
                            Ok(outcome) => debug!(
                                scheduled = outcome.scheduled.len(),
                                flushed = outcome.flushed.len(),
                                dropped = outcome.dropped_payloads,
                                "Server content applied"
                            ),
                            Err(e) => warn!(error = %e, "Server content rejected"),
                        }
                    }
                    Some(Ok(LiveEvent::GoAway { time_left })) => {
                        warn!(?time_left, "Server will end the session soon");
                    }
                    Some(Ok(LiveEvent::Closed(reason))) => {
                        self.session.on_remote_closed(reason.as_deref().unwrap_or("no reason given"));
                        break Ok(());
                    }
                    Some(Err(LiveError::Protocol(msg))) => {
                        let err = ProtocolError::Malformed(msg);
                        warn!(error = %err, "Skipping server message");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Gemini transport error");
                        self.session.on_transport_error(&e.to_string());
                        break Err(SessionError::connection(e.to_string()));
                    }
                },
                finished = writer_finished(&mut self.writer) => {
                    // The writer only ends on its own when a send failed.
                    self.writer = None;
                    let reason = match finished {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => format!("writer task failed: {e}"),
                    };
                    error!(error = %reason, "Gemini send failed");
                    self.session.on_transport_error(&reason);
                    break Err(SessionError::connection(reason));
                }
                _ = tick.tick() => {
                    self.session.on_tick();
                }
            }
        };

        self.stop().await;
        result
    }

    /// Releases the microphone, the socket and all scheduled playback.
    /// Safe to call in any state and more than once.
    pub async fn stop(&mut self) {
        self.release_input();
        self.session.stop();
        self.receiver = None;
        self.outbound_tx = None;
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_SHUTDOWN, &mut writer).await.is_err() {
                warn!("Writer task did not finish in time, aborting");
                writer.abort();
            }
        }
    }

    fn release_input(&mut self) {
        self.microphone = None;
        self.samples_rx = None;
        self.pipeline.reset();
    }

    fn capture(&mut self, samples: &[f32]) {
        for frame in self.pipeline.push(samples) {
            if let Some(frame) = self.session.on_capture_frame(frame) {
                self.forward(frame);
            }
        }
    }

    fn forward(&mut self, frame: CapturedFrame) {
        let Some(tx) = &self.outbound_tx else {
            return;
        };
        if tx.send(frame).is_err() {
            warn!("Writer task has stopped, outbound audio is dropped");
            self.outbound_tx = None;
        }
    }
}

async fn recv_samples(rx: &mut Option<mpsc::UnboundedReceiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn writer_finished(
    writer: &mut Option<JoinHandle<Result<(), LiveError>>>,
) -> Result<Result<(), LiveError>, JoinError> {
    match writer {
        Some(writer) => writer.await,
        None => std::future::pending().await,
    }
}

async fn next_event(receiver: &mut Option<LiveReceiver>) -> Option<Result<LiveEvent, LiveError>> {
    match receiver {
        Some(receiver) => receiver.next_event().await,
        None => std::future::pending().await,
    }
}

/// Sends frames in capture order until the channel closes, then closes the socket.
/// Returns early with the error of the first failed send.
async fn write_frames(
    mut sender: LiveSender,
    mut frames: mpsc::UnboundedReceiver<CapturedFrame>,
) -> Result<(), LiveError> {
    while let Some(frame) = frames.recv().await {
        let seq = frame.seq;
        if let Err(e) = sender.send_audio(frame.mime_type, frame.data).await {
            error!(seq, error = %e, "Failed to send audio frame");
            return Err(e);
        }
    }
    if let Err(e) = sender.close().await {
        debug!(error = %e, "Socket already closed");
    }
    info!("Writer task finished");
    Ok(())
}
