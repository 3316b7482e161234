//! JSON frames exchanged with the session service.
//!
//! Every frame is an object tagged by `type`. Newer service frames are flat;
//! the legacy ones carry their payload under `data`.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AudioConfig;
use crate::context::{ContextPatch, EnterpriseContext, UserRole};
use crate::error::{ProtocolError, codes};
use crate::message::SessionMessage;
use crate::tool_calls::{ToolCall, ToolCallResponse};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioPayload {
    pub audio: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        features: Option<Value>,
    },
    #[serde(rename = "context_loaded")]
    ContextLoaded {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        stats: Option<Value>,
    },
    #[serde(rename = "ai_response")]
    AiResponse {
        #[serde(default)]
        message: String,
        #[serde(default)]
        confidence: Option<Value>,
        #[serde(default)]
        source: Option<Value>,
        /// Epoch milliseconds or an RFC 3339 string.
        #[serde(default)]
        timestamp: Option<Value>,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "context_error")]
    ContextError {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<Value>,
    },
    #[serde(rename = "context_refreshed")]
    ContextRefreshed {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "warning")]
    Warning {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        received_type: Option<String>,
        #[serde(default)]
        details: Option<Value>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<Value>,
        #[serde(default)]
        recoverable: Option<bool>,
    },

    #[serde(rename = "message")]
    Message { data: SessionMessage },
    #[serde(rename = "audio")]
    Audio { data: AudioPayload },
    #[serde(rename = "toolCall")]
    ToolCall { data: ToolCall },
    #[serde(rename = "contextUpdate")]
    ContextUpdate { data: ContextPatch },
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "session_ready")]
    SessionReady,

    #[serde(other)]
    Unrecognized,
}

/// A decoded inbound frame together with its raw `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    pub frame_type: String,
    pub frame: InboundFrame,
}

/// Decodes one text frame. Invalid JSON, a missing `type` tag, or a known
/// type with a malformed body yield a recoverable `INVALID_FRAME` error.
pub fn parse_frame(text: &str) -> Result<ParsedFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| invalid_frame(format!("Invalid JSON: {}", e), None))?;
    let frame_type = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => return Err(invalid_frame("Frame has no string `type` field".into(), None)),
    };
    let frame = serde_json::from_value::<InboundFrame>(value).map_err(|e| {
        invalid_frame(
            format!("Malformed `{}` frame: {}", frame_type, e),
            Some(Value::String(frame_type.clone())),
        )
    })?;
    Ok(ParsedFrame { frame_type, frame })
}

fn invalid_frame(message: String, details: Option<Value>) -> ProtocolError {
    ProtocolError::new(codes::INVALID_FRAME, message, true).with_details(details)
}

/// Converts an `ai_response` timestamp to epoch milliseconds.
pub fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.parse::<i64>().ok()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkData {
    pub audio: String,
    pub sample_rate: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamStartData {
    pub session_id: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamStopData {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "init_context", rename_all = "camelCase")]
    InitContext {
        user_id: String,
        user_role: UserRole,
        session_id: String,
        context: EnterpriseContext,
        audio_config: AudioConfig,
    },
    #[serde(rename = "message")]
    Message { data: SessionMessage },
    #[serde(rename = "audioChunk")]
    AudioChunk { data: AudioChunkData },
    #[serde(rename = "audioStreamStart")]
    AudioStreamStart { data: AudioStreamStartData },
    #[serde(rename = "audioStreamStop")]
    AudioStreamStop { data: AudioStreamStopData },
    #[serde(rename = "contextUpdate")]
    ContextUpdate { data: EnterpriseContext },
    #[serde(rename = "toolCallResponse")]
    ToolCallResponse { data: ToolCallResponse },
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
}

impl OutboundFrame {
    pub fn init_context(context: &EnterpriseContext, session_id: &str, audio_config: &AudioConfig) -> Self {
        OutboundFrame::InitContext {
            user_id: context.user_id.clone(),
            user_role: context.user_role,
            session_id: session_id.to_string(),
            context: context.clone(),
            audio_config: audio_config.clone(),
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            OutboundFrame::InitContext { .. } => "init_context",
            OutboundFrame::Message { .. } => "message",
            OutboundFrame::AudioChunk { .. } => "audioChunk",
            OutboundFrame::AudioStreamStart { .. } => "audioStreamStart",
            OutboundFrame::AudioStreamStop { .. } => "audioStreamStop",
            OutboundFrame::ContextUpdate { .. } => "contextUpdate",
            OutboundFrame::ToolCallResponse { .. } => "toolCallResponse",
            OutboundFrame::Ping { .. } => "ping",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
