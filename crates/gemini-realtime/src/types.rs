//! Wire types of the Gemini Live `BidiGenerateContent` websocket.

use asc_live_core::ServerEvent;
use serde::{Deserialize, Serialize};

// --- Client -> server ---

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Audio,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Enables transcription; the server takes an empty object.
#[derive(Serialize, Debug, Clone, Default)]
pub struct AudioTranscriptionConfig {}

#[derive(Serialize, Debug, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Part {
    pub text: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

// --- Server -> client ---

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<LiveServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerContent {
    pub model_turn: Option<ServerContentTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ServerContentTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerBlob {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

impl From<LiveServerContent> for ServerEvent {
    fn from(content: LiveServerContent) -> Self {
        let audio = content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|blob| {
                        blob.mime_type
                            .as_deref()
                            .is_none_or(|mime| mime.starts_with("audio/"))
                    })
                    .map(|blob| blob.data)
                    .collect()
            })
            .unwrap_or_default();

        ServerEvent {
            input_transcript: content.input_transcription.and_then(|t| t.text),
            output_transcript: content.output_transcription.and_then(|t| t.text),
            interrupted: content.interrupted,
            audio,
            turn_complete: content.turn_complete,
        }
    }
}
