//! Websocket client for the Gemini Live API.
//!
//! [`connect`] opens the socket, sends the setup message and waits for the
//! server's `setupComplete`, which is when the remote model has accepted the
//! session. The connection is then split into a [`LiveSender`] and a
//! [`LiveReceiver`] so outbound audio and inbound events can be driven
//! independently.

use crate::types::{
    AudioTranscriptionConfig, Blob, ClientMessage, Content, GenerationConfig, LiveServerContent,
    Part, PrebuiltVoiceConfig, RealtimeInput, ResponseModality, ServerMessage, Setup, SpeechConfig,
    VoiceConfig,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are ASC Live Assistant. Help the student study. Be concise, friendly, and academic.";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Failed to serialize client message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Malformed server message: {0}")]
    Protocol(String),
    #[error("Connection closed during setup{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ClosedDuringSetup(Option<String>),
}

/// Everything needed to open a live session.
#[derive(Clone)]
pub struct LiveConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    /// Audio out with the configured voice, both directions transcribed.
    pub fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(Setup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: self.system_instruction.clone(),
                }],
            }),
            input_audio_transcription: Some(AudioTranscriptionConfig::default()),
            output_audio_transcription: Some(AudioTranscriptionConfig::default()),
        })
    }
}

impl fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .finish()
    }
}

/// An inbound event after setup.
#[derive(Debug)]
pub enum LiveEvent {
    Content(LiveServerContent),
    /// The server will close the connection soon.
    GoAway { time_left: Option<String> },
    Closed(Option<String>),
}

/// Connects and completes the setup handshake.
pub async fn connect(config: &LiveConfig) -> Result<(LiveSender, LiveReceiver), LiveError> {
    let (ws_stream, _) = connect_async(config.url()).await?;
    info!(model = %config.model, "Connected to Gemini Live WebSocket.");
    let (sink, stream) = ws_stream.split();
    let mut sender = LiveSender { sink };
    let mut receiver = LiveReceiver { stream };

    sender.send(&config.setup_message()).await?;
    receiver.wait_for_setup_complete().await?;
    info!("Gemini session setup is complete. Ready for bidirectional streaming.");
    Ok((sender, receiver))
}

pub struct LiveSender {
    sink: SplitSink<WsStream, WsMessage>,
}

impl LiveSender {
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), LiveError> {
        let payload = serde_json::to_string(msg)?;
        self.sink.send(WsMessage::Text(payload.into())).await?;
        Ok(())
    }

    pub async fn send_audio(&mut self, mime_type: &str, data: String) -> Result<(), LiveError> {
        let msg = ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: mime_type.to_string(),
                data,
            },
        });
        self.send(&msg).await
    }

    /// Sends a close frame and shuts the write half down.
    pub async fn close(&mut self) -> Result<(), LiveError> {
        self.sink.close().await?;
        Ok(())
    }
}

pub struct LiveReceiver {
    stream: SplitStream<WsStream>,
}

impl LiveReceiver {
    async fn wait_for_setup_complete(&mut self) -> Result<(), LiveError> {
        while let Some(frame) = self.stream.next().await {
            let msg = match frame? {
                WsMessage::Close(frame) => {
                    return Err(LiveError::ClosedDuringSetup(
                        frame.map(|f| f.reason.as_str().to_owned()),
                    ));
                }
                other => match parse_frame(other)? {
                    Some(msg) => msg,
                    None => continue,
                },
            };
            if msg.setup_complete.is_some() {
                return Ok(());
            }
            warn!(?msg, "Received unexpected message during Gemini setup");
        }
        Err(LiveError::ClosedDuringSetup(None))
    }

    /// Waits for the next meaningful event. `None` once the stream has ended.
    ///
    /// A `LiveError::Protocol` concerns a single frame; the stream stays usable.
    pub async fn next_event(&mut self) -> Option<Result<LiveEvent, LiveError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            if let WsMessage::Close(frame) = frame {
                return Some(Ok(LiveEvent::Closed(frame.map(|f| f.reason.as_str().to_owned()))));
            }
            let msg = match parse_frame(frame) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            if let Some(go_away) = msg.go_away {
                return Some(Ok(LiveEvent::GoAway {
                    time_left: go_away.time_left,
                }));
            }
            match msg.server_content {
                Some(content) => return Some(Ok(LiveEvent::Content(content))),
                None => debug!("Skipping server message without content"),
            }
        }
    }
}

/// Parses a data frame. Control frames yield `Ok(None)`.
fn parse_frame(frame: WsMessage) -> Result<Option<ServerMessage>, LiveError> {
    let parsed = match frame {
        WsMessage::Text(text) => serde_json::from_str::<ServerMessage>(text.as_str()),
        WsMessage::Binary(bytes) => serde_json::from_slice::<ServerMessage>(&bytes),
        _ => return Ok(None),
    };
    parsed
        .map(Some)
        .map_err(|e| LiveError::Protocol(e.to_string()))
}
