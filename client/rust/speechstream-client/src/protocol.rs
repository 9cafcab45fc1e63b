use crate::error::{Result, StreamError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.8,
        }
    }
}

/// Outgoing messages, in the order one synthesis turn sends them.
#[derive(Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutMsg {
    /// Opens a session on a fresh connection. `text` is a single space.
    SessionConfig {
        text: String,
        model_id: String,
        voice_settings: VoiceSettings,
        xi_api_key: String,
    },
    Text {
        text: String,
        try_trigger_generation: bool,
    },
    /// Empty text: no more input for this turn.
    EndOfStream { text: String },
}

impl OutMsg {
    pub fn session_config(model_id: &str, voice_settings: VoiceSettings, api_key: &str) -> Self {
        Self::SessionConfig {
            text: " ".to_string(),
            model_id: model_id.to_string(),
            voice_settings,
            xi_api_key: api_key.to_string(),
        }
    }

    pub fn text(text: &str, try_trigger_generation: bool) -> Self {
        Self::Text {
            text: text.to_string(),
            try_trigger_generation,
        }
    }

    pub fn end_of_stream() -> Self {
        Self::EndOfStream {
            text: String::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionConfig { .. } => "session_config",
            Self::Text { .. } => "text",
            Self::EndOfStream { .. } => "end_of_stream",
        }
    }
}

// Hand-written so the API key never ends up in a log line.
impl std::fmt::Debug for OutMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionConfig {
                model_id,
                voice_settings,
                ..
            } => f
                .debug_struct("SessionConfig")
                .field("model_id", model_id)
                .field("voice_settings", voice_settings)
                .field("xi_api_key", &"<redacted>")
                .finish(),
            Self::Text {
                text,
                try_trigger_generation,
            } => f
                .debug_struct("Text")
                .field("chars", &text.chars().count())
                .field("try_trigger_generation", try_trigger_generation)
                .finish(),
            Self::EndOfStream { .. } => f.write_str("EndOfStream"),
        }
    }
}

pub fn encode_out_msg(msg: &OutMsg) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| StreamError::Serialization(e.to_string()))
}

/// Raw shape of a server message. Every field is optional on the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InMsg {
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub is_final: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Decoded audio for one inbound message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioChunk {
    pub pcm: Vec<u8>,
    pub is_final: bool,
}

pub fn decode_in_msg(text: &str) -> Result<AudioChunk> {
    let msg: InMsg =
        serde_json::from_str(text).map_err(|e| StreamError::ProtocolDecode(e.to_string()))?;

    if let Some(error) = msg.error {
        let detail = match msg.message {
            Some(message) if !message.is_empty() => format!("{error}: {message}"),
            _ => error,
        };
        return Err(StreamError::Server(detail));
    }

    let pcm = match msg.audio.as_deref() {
        None | Some("") => Vec::new(),
        Some(b64) => BASE64
            .decode(b64)
            .map_err(|e| StreamError::ProtocolDecode(format!("invalid base64 audio: {e}")))?,
    };

    Ok(AudioChunk {
        pcm,
        is_final: msg.is_final.unwrap_or(false),
    })
}

/// Decodes a binary frame; the service only ever sends UTF-8 JSON.
pub fn decode_in_frame(bytes: &[u8]) -> Result<AudioChunk> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| StreamError::ProtocolDecode(format!("binary frame is not utf-8: {e}")))?;
    decode_in_msg(text)
}

/// The messages one utterance produces. The session config is only included
/// for the first turn on a connection.
pub fn turn_messages(
    text: &str,
    try_trigger_generation: bool,
    session_config: Option<OutMsg>,
) -> Vec<OutMsg> {
    let mut msgs = Vec::with_capacity(3);
    msgs.extend(session_config);
    msgs.push(OutMsg::text(text, try_trigger_generation));
    msgs.push(OutMsg::end_of_stream());
    msgs
}
