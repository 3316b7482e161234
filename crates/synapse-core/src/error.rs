//! Error taxonomy for the session engine.
//!
//! Rust-level failures (`ConfigError`, `TransportError`, `AudioCaptureError`,
//! `SessionError`) are returned from calls. `ProtocolError` and
//! `ProtocolWarning` are plain payloads that only travel inside emitted
//! session events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::now_ms;

/// Error codes carried by emitted [`ProtocolError`]s.
pub mod codes {
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const HANDSHAKE_TIMEOUT: &str = "HANDSHAKE_TIMEOUT";
    pub const MAX_RECONNECT_ATTEMPTS: &str = "MAX_RECONNECT_ATTEMPTS";
    pub const CONTEXT_ERROR: &str = "CONTEXT_ERROR";
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// Invalid session options, reported when a session is spawned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid service URL '{0}': expected an http(s) or ws(s) URL")]
    InvalidServiceUrl(String),
    #[error("Missing credentials for the session service")]
    MissingCredentials,
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Failure to open the transport to the session service.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Connection failed: {0}")]
    Connect(String),
}

/// Failure to acquire or drive the capture device.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AudioCaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Audio engine failure: {0}")]
    Engine(String),
}

/// Errors returned by [`crate::session::SessionHandle`] calls.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is not connected")]
    NotConnected,
    #[error(transparent)]
    AudioCapture(#[from] AudioCaptureError),
    #[error("Session task has stopped")]
    Closed,
}

/// An error surfaced to subscribers, either raised by the peer or by the
/// connection manager itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub recoverable: bool,
    pub timestamp: i64,
}

impl ProtocolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            recoverable,
            timestamp: now_ms(),
        }
    }

    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// An informational notice; never changes session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolWarning {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: i64,
}
