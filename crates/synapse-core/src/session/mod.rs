//! The Connection Manager: a cloneable [`SessionHandle`] in front of a single
//! actor task that owns the transport, timers, history and pending tool calls.

mod actor;
mod event;
#[cfg(test)]
mod tests;

pub use event::{ConnectionStatus, SessionEvent, SessionSnapshot};

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;

use crate::audio::AudioEngine;
use crate::config::SessionOptions;
use crate::context::{ContextPatch, EnterpriseContext};
use crate::error::{ConfigError, SessionError};
use crate::heartbeat::ConnectionQuality;
use crate::message::{MessageKind, SessionMessage};
use crate::metrics::Metrics;
use crate::tool_calls::{ToolCall, ToolCallResponse};
use crate::transport::Connector;

use actor::SessionActor;

const COMMAND_CAPACITY: usize = 64;

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        content: String,
        kind: MessageKind,
        reply: oneshot::Sender<Result<SessionMessage, SessionError>>,
    },
    StartAudio {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopAudio {
        reply: oneshot::Sender<()>,
    },
    SetVolume {
        target: VolumeTarget,
        volume: f32,
        reply: oneshot::Sender<f32>,
    },
    UpdateContext {
        patch: ContextPatch,
        reply: oneshot::Sender<EnterpriseContext>,
    },
    RespondToolCall {
        response: ToolCallResponse,
        reply: oneshot::Sender<bool>,
    },
    ClearHistory {
        reply: oneshot::Sender<()>,
    },
    History {
        reply: oneshot::Sender<Vec<SessionMessage>>,
    },
    PendingToolCalls {
        reply: oneshot::Sender<Vec<ToolCall>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VolumeTarget {
    Input,
    Output,
}

/// Caller-side handle to a running session.
///
/// Clones share the same session. When the last clone is dropped the
/// session disconnects and its task ends.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SessionHandle {
    /// Validates the options and spawns the session task. The session starts
    /// `disconnected`; call [`SessionHandle::connect`] to open it.
    pub fn spawn(
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioEngine>,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let endpoint = options.endpoint_url()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, _) = broadcast::channel(options.event_capacity);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let span = tracing::info_span!(
            "synapse_session",
            user_id = %options.context.user_id,
            role = %options.context.user_role
        );
        let actor = SessionActor::new(options, endpoint, connector, audio, command_rx, events_tx.clone(), status_tx);
        tokio::spawn(actor.run().instrument(span));

        Ok(Self {
            commands: command_tx,
            events: events_tx,
            status: status_rx,
        })
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Starts connecting. Returns once the attempt is under way; observe
    /// [`SessionHandle::status`] or the event stream for the outcome.
    /// A no-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Sends a message with the current context attached and appends it to
    /// the history. Fails with [`SessionError::NotConnected`] unless connected.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Result<SessionMessage, SessionError> {
        let content = content.into();
        self.request(|reply| Command::SendMessage { content, kind, reply })
            .await?
    }

    pub async fn start_audio_stream(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StartAudio { reply }).await?
    }

    pub async fn stop_audio_stream(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StopAudio { reply }).await
    }

    /// Sets the capture gain on the audio engine. The value is clamped to
    /// `0.0..=1.0`; the applied gain is returned.
    pub async fn set_input_volume(&self, volume: f32) -> Result<f32, SessionError> {
        self.request(|reply| Command::SetVolume { target: VolumeTarget::Input, volume, reply })
            .await
    }

    /// Sets the playback gain on the audio engine, clamped like
    /// [`SessionHandle::set_input_volume`].
    pub async fn set_output_volume(&self, volume: f32) -> Result<f32, SessionError> {
        self.request(|reply| Command::SetVolume { target: VolumeTarget::Output, volume, reply })
            .await
    }

    /// Merges `patch` into the held context and returns the result.
    pub async fn update_context(&self, patch: ContextPatch) -> Result<EnterpriseContext, SessionError> {
        self.request(|reply| Command::UpdateContext { patch, reply }).await
    }

    /// Answers a pending tool call. Returns `false` if no call with that id
    /// is pending.
    pub async fn respond_to_tool_call(&self, id: impl Into<String>, data: Value) -> Result<bool, SessionError> {
        let response = ToolCallResponse::success(id, data);
        self.request(|reply| Command::RespondToolCall { response, reply }).await
    }

    pub async fn reject_tool_call(
        &self,
        id: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<bool, SessionError> {
        let response = ToolCallResponse::failure(id, error);
        self.request(|reply| Command::RespondToolCall { response, reply }).await
    }

    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::ClearHistory { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<SessionMessage>, SessionError> {
        self.request(|reply| Command::History { reply }).await
    }

    pub async fn pending_tool_calls(&self) -> Result<Vec<ToolCall>, SessionError> {
        self.request(|reply| Command::PendingToolCalls { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn metrics(&self) -> Result<Metrics, SessionError> {
        Ok(self.snapshot().await?.metrics)
    }

    pub async fn quality(&self) -> Result<ConnectionQuality, SessionError> {
        Ok(self.snapshot().await?.quality)
    }

    pub async fn context(&self) -> Result<EnterpriseContext, SessionError> {
        Ok(self.snapshot().await?.context)
    }

    /// Id of the current connection attempt.
    pub async fn session_id(&self) -> Result<String, SessionError> {
        Ok(self.snapshot().await?.session_id)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Resolves once the status equals `target`.
    pub async fn wait_for_status(&self, target: ConnectionStatus) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        status
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
