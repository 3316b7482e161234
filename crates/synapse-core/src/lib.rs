//! Realtime conversational session engine.
//!
//! A [`SessionHandle`] keeps one persistent connection to the Synapse voice
//! service and multiplexes text messages, PCM16 audio, tool calls and context
//! updates over it. Transport and audio hardware are supplied by the caller
//! through the [`Connector`] and [`AudioEngine`] traits.

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod heartbeat;
pub mod ids;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod tool_calls;
pub mod transport;

pub use audio::AudioEngine;
pub use config::{AudioConfig, SessionOptions};
pub use context::{ContextPatch, EnterpriseContext, UserRole};
pub use error::{
    AudioCaptureError, ConfigError, ProtocolError, ProtocolWarning, SessionError, TransportError,
};
pub use heartbeat::ConnectionQuality;
pub use message::{MessageKind, SessionMessage};
pub use metrics::Metrics;
pub use session::{ConnectionStatus, SessionEvent, SessionHandle, SessionSnapshot};
pub use tool_calls::{ToolCall, ToolCallResponse};
pub use transport::Connector;
