//! Session options, their defaults, and validation.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::EnterpriseContext;
use crate::error::ConfigError;

pub const DEFAULT_SESSION_PATH: &str = "synapse-live-voice";

/// Capture settings sent to the peer in `init_context` and used for the
/// capture constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub sample_rate: u32,
    #[serde(rename = "enableVAD")]
    pub enable_vad: bool,
    pub speech_threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            enable_vad: true,
            speech_threshold: 0.05,
        }
    }
}

/// Everything a session needs to run.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Base URL of the service, e.g. `https://project.example.co`.
    pub service_url: String,
    pub credentials: SecretString,
    pub context: EnterpriseContext,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Base delay of the exponential backoff.
    pub reconnect_delay: Duration,
    /// When set, a session left in `error` by a recoverable failure calls
    /// `connect` again after this delay. Off by default.
    pub error_retry_delay: Option<Duration>,
    pub audio: AudioConfig,
    pub session_path: String,
    /// Bound on the whole two-phase handshake of one attempt.
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub quality_check_interval: Duration,
    pub tool_call_ttl: Duration,
    pub audio_backlog_capacity: usize,
    pub event_capacity: usize,
}

impl SessionOptions {
    pub fn new(
        service_url: impl Into<String>,
        credentials: SecretString,
        context: EnterpriseContext,
    ) -> Self {
        Self {
            service_url: service_url.into(),
            credentials,
            context,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(2000),
            error_retry_delay: None,
            audio: AudioConfig::default(),
            session_path: DEFAULT_SESSION_PATH.to_string(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            quality_check_interval: Duration::from_secs(5),
            tool_call_ttl: Duration::from_secs(120),
            audio_backlog_capacity: 32,
            event_capacity: 256,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;
        if self.credentials.expose_secret().trim().is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.context.user_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue("context.user_id", "must not be empty".into()));
        }
        if self.auto_reconnect && self.reconnect_delay.is_zero() {
            return Err(ConfigError::InvalidValue(
                "reconnect_delay",
                "must be greater than zero when auto_reconnect is enabled".into(),
            ));
        }
        if self.error_retry_delay.is_some_and(|delay| delay.is_zero()) {
            return Err(ConfigError::InvalidValue("error_retry_delay", "must be greater than zero".into()));
        }
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::InvalidValue("audio.sample_rate", "must be greater than zero".into()));
        }
        if !(0.0..=1.0).contains(&self.audio.speech_threshold) {
            return Err(ConfigError::InvalidValue(
                "audio.speech_threshold",
                format!("{} is outside 0.0..=1.0", self.audio.speech_threshold),
            ));
        }
        for (name, value) in [
            ("handshake_timeout", self.handshake_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("quality_check_interval", self.quality_check_interval),
            ("tool_call_ttl", self.tool_call_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue(name, "must be greater than zero".into()));
            }
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(ConfigError::InvalidValue(
                "heartbeat_timeout",
                "must not be shorter than heartbeat_interval".into(),
            ));
        }
        if self.audio_backlog_capacity == 0 || self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "audio_backlog_capacity/event_capacity",
                "must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// `wss://<host>/functions/v1/<session_path>`, derived from `service_url`.
    pub fn endpoint_url(&self) -> Result<String, ConfigError> {
        let url = self.service_url.trim().trim_end_matches('/');
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidServiceUrl(self.service_url.clone()))?;
        let ws_scheme = match scheme.to_lowercase().as_str() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            _ => return Err(ConfigError::InvalidServiceUrl(self.service_url.clone())),
        };
        if rest.is_empty() {
            return Err(ConfigError::InvalidServiceUrl(self.service_url.clone()));
        }
        let path = self.session_path.trim_matches('/');
        if path.is_empty() {
            return Err(ConfigError::InvalidValue("session_path", "must not be empty".into()));
        }
        Ok(format!("{}://{}/functions/v1/{}", ws_scheme, rest, path))
    }
}
