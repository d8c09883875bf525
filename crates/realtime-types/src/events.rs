//! Event vocabulary shared by the relay, its clients and the upstream service.
//!
//! The relay never re-encodes frames it forwards. These types only exist to
//! classify frames and to extract the transcript payloads it persists.

use crate::session::Session;
use serde::{Deserialize, Serialize};

pub const INPUT_AUDIO_BUFFER_APPEND: &str = "input_audio_buffer.append";
pub const CONVERSATION_ITEM_CREATE: &str = "conversation.item.create";
pub const RESPONSE_CREATE: &str = "response.create";
pub const SESSION_UPDATE: &str = "session.update";

pub const RESPONSE_AUDIO_TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";
pub const RESPONSE_AUDIO_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";
pub const INPUT_AUDIO_TRANSCRIPTION_COMPLETED: &str =
    "conversation.item.input_audio_transcription.completed";
pub const ERROR: &str = "error";

/// Client frame types the relay is willing to forward upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrameKind {
    InputAudioBufferAppend,
    ConversationItemCreate,
    ResponseCreate,
}

impl ClientFrameKind {
    pub fn from_type(event_type: &str) -> Option<Self> {
        match event_type {
            INPUT_AUDIO_BUFFER_APPEND => Some(Self::InputAudioBufferAppend),
            CONVERSATION_ITEM_CREATE => Some(Self::ConversationItemCreate),
            RESPONSE_CREATE => Some(Self::ResponseCreate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputAudioBufferAppend => INPUT_AUDIO_BUFFER_APPEND,
            Self::ConversationItemCreate => CONVERSATION_ITEM_CREATE,
            Self::ResponseCreate => RESPONSE_CREATE,
        }
    }
}

/// Reads the `type` field of a raw client frame.
///
/// Returns `None` for frames that are not JSON objects with a string `type`.
pub fn frame_type(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

/// `session.update` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdateEvent {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,

    /// The session configuration to apply
    session: Session,
}

impl SessionUpdateEvent {
    pub fn new(session: Session) -> Self {
        Self {
            event_type: SESSION_UPDATE.to_string(),
            event_id: None,
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
}

impl ErrorDetails {
    pub fn new(error_type: &str, message: &str) -> Self {
        Self {
            error_type: error_type.to_string(),
            code: None,
            message: message.to_string(),
            event_id: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The upstream frame categories the relay intercepts. Every other frame type
/// lands in `Other` and is only forwarded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetails,
    },
    #[serde(other)]
    Other,
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Events the relay itself originates towards its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    ConnectionReady { session_id: String },
    Error { error: ErrorDetails },
}

impl RelayEvent {
    pub fn error(code: &str, message: &str) -> Self {
        Self::Error {
            error: ErrorDetails::new("relay_error", message).with_code(code),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
