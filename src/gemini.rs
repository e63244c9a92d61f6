//! Gemini Live API module
//!
//! Wire types for the bidirectional live session and the demultiplexing of
//! inbound server messages into [`ApiResponse`] events.

use crate::encoder::EncodedChunk;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

/// Speech configuration for the audio response modality.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SpeechConfig {
    pub fn prebuilt(voice_name: &str) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.to_string(),
                },
            },
        }
    }
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

/// Whether the model waits for a function's result before continuing.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Behavior {
    Blocking,
    NonBlocking,
}

/// Schema of one callable tool, declared at setup.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<Behavior>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Session setup message.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub audio: RealtimeAudio,
}

/// Result of one function call, correlated by id.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Wrap an encoded capture frame as realtime audio input.
    pub fn audio(chunk: &EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: RealtimeAudio {
                data: chunk.to_base64(),
                mime_type: chunk.mime_type().to_string(),
            },
        })
    }

    pub fn tool_response(function_responses: Vec<FunctionResponse>) -> Self {
        ClientMessage::ToolResponse(ToolResponse { function_responses })
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => "setup",
            ClientMessage::RealtimeInput(_) => "realtimeInput",
            ClientMessage::ToolResponse(_) => "toolResponse",
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_final: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
    #[serde(default)]
    pub generation_complete: Option<bool>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

/// A function call requested by the model.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Server -> client message. Any combination of fields may be present.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Transcript from the Gemini API
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// Response from the Gemini API
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Setup has been completed
    SetupComplete,

    /// A chunk of model speech (16-bit PCM at the output rate)
    AudioDelta { data: Vec<u8>, mime_type: Option<String> },

    /// Text part of a model turn
    TextResponse(String),

    /// Transcription of user input
    InputTranscription(Transcript),

    /// Transcription of model output
    OutputTranscription(Transcript),

    /// Model is requesting one or more function calls
    ToolCall(Vec<FunctionCall>),

    /// Model has cancelled earlier function calls
    ToolCallCancellation(Vec<String>),

    /// User barged in; drop queued playback
    Interrupted,

    /// Model finished its turn
    TurnComplete,

    /// Model finished generating; playback may still be running
    GenerationComplete,

    /// Server will disconnect soon
    GoAway { time_left: Option<String> },

    /// The websocket closed
    Closed { reason: Option<String> },
}

/// Parse one inbound text frame into ordered events.
pub fn parse_server_message(text: &str) -> Result<Vec<ApiResponse>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    Ok(demux(message))
}

/// Split a server message into events: audio, text, transcriptions, tool
/// calls, interruption, turn completion, go-away.
pub fn demux(message: ServerMessage) -> Vec<ApiResponse> {
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ApiResponse::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if let Some(model_turn) = content.model_turn {
            for part in model_turn.parts {
                if let Some(blob) = part.inline_data {
                    match general_purpose::STANDARD.decode(&blob.data) {
                        Ok(data) if !data.is_empty() => events.push(ApiResponse::AudioDelta {
                            data,
                            mime_type: blob.mime_type,
                        }),
                        Ok(_) => {}
                        Err(e) => warn!("Skipping undecodable inline data: {}", e),
                    }
                } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(ApiResponse::TextResponse(text));
                }
            }
        }

        if let Some(t) = content.input_transcription {
            if let Some(text) = t.text.filter(|t| !t.is_empty()) {
                events.push(ApiResponse::InputTranscription(Transcript {
                    text,
                    is_final: t.is_final.unwrap_or(false),
                }));
            }
        }

        if let Some(t) = content.output_transcription {
            if let Some(text) = t.text.filter(|t| !t.is_empty()) {
                events.push(ApiResponse::OutputTranscription(Transcript {
                    text,
                    is_final: t.is_final.unwrap_or(false),
                }));
            }
        }

        if let Some(tool_call) = message.tool_call {
            if !tool_call.function_calls.is_empty() {
                events.push(ApiResponse::ToolCall(tool_call.function_calls));
            }
        }

        if content.interrupted.unwrap_or(false) {
            events.push(ApiResponse::Interrupted);
        }

        if content.turn_complete.unwrap_or(false) {
            events.push(ApiResponse::TurnComplete);
        }

        if content.generation_complete.unwrap_or(false) {
            events.push(ApiResponse::GenerationComplete);
        }
    } else if let Some(tool_call) = message.tool_call {
        if !tool_call.function_calls.is_empty() {
            events.push(ApiResponse::ToolCall(tool_call.function_calls));
        }
    }

    if let Some(cancellation) = message.tool_call_cancellation {
        events.push(ApiResponse::ToolCallCancellation(cancellation.ids));
    }

    if let Some(go_away) = message.go_away {
        events.push(ApiResponse::GoAway {
            time_left: go_away.time_left,
        });
    }

    events
}
