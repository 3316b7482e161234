use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::audio::{SpeechStateData, VolumeData};
use crate::context::EnterpriseContext;
use crate::error::{ProtocolError, ProtocolWarning};
use crate::heartbeat::ConnectionQuality;
use crate::message::SessionMessage;
use crate::metrics::Metrics;
use crate::tool_calls::{ToolCall, ToolCallResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications broadcast to every subscriber of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChange {
        status: ConnectionStatus,
        previous: ConnectionStatus,
    },
    ConnectionEstablished {
        message: Option<String>,
        features: Option<Value>,
    },
    ContextLoaded {
        message: Option<String>,
        stats: Option<Value>,
    },
    /// Emitted once per completed handshake.
    Connected,
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    /// A reconnection attempt has been scheduled.
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Error(ProtocolError),
    Warning(ProtocolWarning),
    Message(SessionMessage),
    MessageSent(SessionMessage),
    ToolCall(ToolCall),
    ToolCallResponse(ToolCallResponse),
    ToolCallExpired {
        id: String,
    },
    ContextUpdated(EnterpriseContext),
    ContextRefreshed {
        message: Option<String>,
    },
    Pong,
    QualityChange(ConnectionQuality),
    /// Inbound PCM16 bytes, already queued for playback.
    Audio(Bytes),
    Volume(VolumeData),
    SpeechState(SpeechStateData),
    AudioStreamStarted,
    AudioStreamStopped,
}

/// Point-in-time view of the session state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub session_id: String,
    pub context: EnterpriseContext,
    pub quality: ConnectionQuality,
    pub metrics: Metrics,
    pub history_len: usize,
    pub pending_tool_calls: usize,
    pub reconnect_attempts: u32,
    pub audio_streaming: bool,
}
