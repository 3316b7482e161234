use serde_json::Map;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use super::event::{ConnectionStatus, SessionEvent, SessionSnapshot};
use super::{Command, VolumeTarget};
use crate::audio::{pcm, AudioBacklog, AudioEngine, AudioEngineEvent, CaptureConstraints};
use crate::config::SessionOptions;
use crate::context::{ContextPatch, EnterpriseContext};
use crate::error::{codes, AudioCaptureError, ProtocolError, ProtocolWarning, SessionError, TransportError};
use crate::heartbeat::{ConnectionQuality, HeartbeatMonitor};
use crate::ids::{self, now_ms};
use crate::message::{MessageHistory, MessageKind, SessionMessage};
use crate::metrics::Metrics;
use crate::protocol::{
    self, AudioChunkData, AudioStreamStartData, AudioStreamStopData, InboundFrame, OutboundFrame,
};
use crate::reconnect::ReconnectPolicy;
use crate::tool_calls::{ToolCallRegistry, ToolCallResponse};
use crate::transport::{
    ConnectRequest, Connection, Connector, SendError, TransportEvent, TransportSink, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};

const INTERNAL_CAPACITY: usize = 256;

/// Results and events posted back to the actor by the tasks it spawns.
enum Internal {
    Opened {
        generation: u64,
        result: Result<Connection, TransportError>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    CaptureStarted {
        epoch: u64,
        result: Result<mpsc::Receiver<AudioEngineEvent>, AudioCaptureError>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Audio {
        epoch: u64,
        event: AudioEngineEvent,
    },
    CaptureEnded {
        epoch: u64,
    },
}

struct LiveTransport {
    sink: Box<dyn TransportSink>,
    reader: JoinHandle<()>,
}

enum Capture {
    Idle,
    Starting,
    Active { forwarder: JoinHandle<()> },
}

pub(super) struct SessionActor {
    options: SessionOptions,
    endpoint: String,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioEngine>,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    events: broadcast::Sender<SessionEvent>,
    status_tx: watch::Sender<ConnectionStatus>,

    status: ConnectionStatus,
    /// Id of the current transport attempt; anything tagged otherwise is stale.
    generation: u64,
    session_id: String,
    context: EnterpriseContext,
    history: MessageHistory,
    tool_calls: ToolCallRegistry,
    heartbeat: HeartbeatMonitor,
    quality: ConnectionQuality,
    reconnect: ReconnectPolicy,
    metrics: Metrics,

    transport: Option<LiveTransport>,
    handshake_deadline: Option<Pin<Box<Sleep>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    error_retry_timer: Option<Pin<Box<Sleep>>>,
    ping_interval: Option<Interval>,
    maintenance_interval: Option<Interval>,

    capture: Capture,
    capture_epoch: u64,
    backlog: AudioBacklog,
}

impl SessionActor {
    pub(super) fn new(
        options: SessionOptions,
        endpoint: String,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioEngine>,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<SessionEvent>,
        status_tx: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CAPACITY);
        Self {
            endpoint,
            connector,
            audio,
            commands,
            internal_tx,
            internal_rx,
            events,
            status_tx,
            status: ConnectionStatus::Disconnected,
            generation: 0,
            session_id: ids::session_id(),
            context: options.context.clone(),
            history: MessageHistory::default(),
            tool_calls: ToolCallRegistry::default(),
            heartbeat: HeartbeatMonitor::new(options.heartbeat_timeout),
            quality: ConnectionQuality::Good,
            reconnect: ReconnectPolicy::new(options.reconnect_delay, options.max_reconnect_attempts),
            metrics: Metrics::default(),
            transport: None,
            handshake_deadline: None,
            reconnect_timer: None,
            error_retry_timer: None,
            ping_interval: None,
            maintenance_interval: None,
            capture: Capture::Idle,
            capture_epoch: 0,
            backlog: AudioBacklog::new(options.audio_backlog_capacity),
            options,
        }
    }

    pub(super) async fn run(mut self) {
        debug!(endpoint = %self.endpoint, "Session task started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                _ = sleep_opt(&mut self.handshake_deadline) => {
                    self.handshake_deadline = None;
                    let timeout = self.options.handshake_timeout;
                    self.on_attempt_failed(
                        codes::HANDSHAKE_TIMEOUT,
                        format!("Handshake did not complete within {:?}", timeout),
                    );
                }
                _ = sleep_opt(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.begin_attempt();
                }
                _ = sleep_opt(&mut self.error_retry_timer) => {
                    self.error_retry_timer = None;
                    if self.status == ConnectionStatus::Error {
                        info!("Retrying after a recoverable error");
                        self.connect();
                    }
                }
                _ = tick_opt(&mut self.ping_interval) => self.send_ping(),
                _ = tick_opt(&mut self.maintenance_interval) => self.maintenance(),
            }
        }
        self.disconnect("Session dropped");
        debug!("Session task finished");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                self.connect();
                let _ = reply.send(());
            }
            Command::Disconnect { reply } => {
                self.disconnect("Client disconnect");
                let _ = reply.send(());
            }
            Command::SendMessage { content, kind, reply } => {
                let _ = reply.send(self.send_message(content, kind));
            }
            Command::StartAudio { reply } => self.start_audio(reply),
            Command::StopAudio { reply } => {
                self.stop_capture(true);
                let _ = reply.send(());
            }
            Command::SetVolume { target, volume, reply } => {
                let _ = reply.send(self.set_volume(target, volume));
            }
            Command::UpdateContext { patch, reply } => {
                let _ = reply.send(self.update_context(patch));
            }
            Command::RespondToolCall { response, reply } => {
                let _ = reply.send(self.respond_to_tool_call(response));
            }
            Command::ClearHistory { reply } => {
                self.history.clear();
                let _ = reply.send(());
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.to_vec());
            }
            Command::PendingToolCalls { reply } => {
                let _ = reply.send(self.tool_calls.pending());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn set_volume(&self, target: VolumeTarget, volume: f32) -> f32 {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        match target {
            VolumeTarget::Input => self.audio.set_input_volume(volume),
            VolumeTarget::Output => self.audio.set_output_volume(volume),
        }
        debug!(?target, volume, "Volume set");
        volume
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Opened { generation, result } => self.on_opened(generation, result),
            Internal::Transport { generation, event } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Discarding event from superseded transport");
                    return;
                }
                match event {
                    TransportEvent::Text(text) => self.on_text(&text),
                    TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
                }
            }
            Internal::CaptureStarted { epoch, result, reply } => self.on_capture_started(epoch, result, reply),
            Internal::Audio { epoch, event } => {
                if epoch == self.capture_epoch {
                    self.on_audio(event);
                }
            }
            Internal::CaptureEnded { epoch } => {
                if epoch == self.capture_epoch && matches!(self.capture, Capture::Active { .. }) {
                    info!("Audio capture ended");
                    self.capture = Capture::Idle;
                    self.emit(SessionEvent::AudioStreamStopped);
                }
            }
        }
    }

    // --- Connection lifecycle ---

    fn connect(&mut self) {
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                debug!(status = %self.status, "Connect ignored");
            }
            ConnectionStatus::Reconnecting => {
                info!("Connect requested while reconnecting; restarting the attempt sequence");
                self.reconnect_timer = None;
                self.reconnect.reset();
                self.set_status(ConnectionStatus::Connecting);
                self.begin_attempt();
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.error_retry_timer = None;
                self.reconnect.reset();
                self.set_status(ConnectionStatus::Connecting);
                self.begin_attempt();
            }
        }
    }

    fn begin_attempt(&mut self) {
        self.drop_transport("Superseded by a new attempt");
        self.session_id = ids::session_id();
        self.handshake_deadline = Some(Box::pin(tokio::time::sleep(self.options.handshake_timeout)));

        let generation = self.generation;
        info!(generation, session_id = %self.session_id, "Opening transport");
        let connector = self.connector.clone();
        let request = ConnectRequest {
            url: self.endpoint.clone(),
            credentials: self.options.credentials.clone(),
        };
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(request).await;
            let _ = internal.send(Internal::Opened { generation, result }).await;
        });
    }

    fn on_opened(&mut self, generation: u64, result: Result<Connection, TransportError>) {
        let attempting = matches!(self.status, ConnectionStatus::Connecting | ConnectionStatus::Reconnecting);
        if generation != self.generation || !attempting {
            if let Ok(connection) = result {
                debug!(generation, "Closing transport opened for a superseded attempt");
                connection.sink.close(NORMAL_CLOSURE, "Superseded");
            }
            return;
        }

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Transport failed to open");
                self.on_attempt_failed(codes::CONNECTION_ERROR, e.to_string());
                return;
            }
        };

        info!(generation, "Transport open; sending init_context");
        let Connection { sink, mut events } = connection;
        let internal = self.internal_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, TransportEvent::Closed { .. });
                if internal.send(Internal::Transport { generation, event }).await.is_err() || closed {
                    return;
                }
            }
            let event = TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "Transport stream ended".to_string(),
            };
            let _ = internal.send(Internal::Transport { generation, event }).await;
        });
        self.transport = Some(LiveTransport { sink, reader });
        self.start_heartbeat();

        let init = OutboundFrame::init_context(&self.context, &self.session_id, &self.options.audio);
        self.send_frame(init);
    }

    /// Second half of the handshake (`context_loaded` or `session_ready`).
    fn complete_handshake(&mut self) {
        let attempting = matches!(self.status, ConnectionStatus::Connecting | ConnectionStatus::Reconnecting);
        if !attempting || self.transport.is_none() {
            debug!(status = %self.status, "Handshake completion outside an attempt; ignoring");
            return;
        }
        self.handshake_deadline = None;
        self.reconnect.reset();
        self.set_status(ConnectionStatus::Connected);
        self.emit(SessionEvent::Connected);
    }

    fn on_attempt_failed(&mut self, code: &str, message: String) {
        self.drop_transport("Handshake failed");
        match self.status {
            ConnectionStatus::Reconnecting => {
                warn!(code, %message, attempt = self.reconnect.attempts(), "Reconnection attempt failed");
                self.schedule_reconnect();
            }
            ConnectionStatus::Connecting => {
                self.fail(ProtocolError::new(code, message, true));
            }
            _ => {}
        }
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        info!(code, %reason, status = %self.status, "Transport closed");
        self.stop_capture(false);
        self.drop_transport("Closed by peer");

        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
            _ if code == NORMAL_CLOSURE => self.mark_disconnected(Some(code), reason),
            ConnectionStatus::Connecting => self.on_attempt_failed(
                codes::CONNECTION_ERROR,
                format!("Connection closed before the context was loaded ({}): {}", code, reason),
            ),
            _ if !self.options.auto_reconnect => self.mark_disconnected(Some(code), reason),
            ConnectionStatus::Connected | ConnectionStatus::Reconnecting => self.schedule_reconnect(),
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_attempt() {
            Some((attempt, delay)) => {
                info!(attempt, max = self.reconnect.max_attempts(), ?delay, "Scheduling reconnection");
                self.metrics.reconnections += 1;
                self.set_status(ConnectionStatus::Reconnecting);
                self.emit(SessionEvent::Reconnecting { attempt, delay });
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                let max = self.reconnect.max_attempts();
                self.fail(ProtocolError::new(
                    codes::MAX_RECONNECT_ATTEMPTS,
                    format!("Gave up after {} reconnection attempts", max),
                    false,
                ));
            }
        }
    }

    /// Teardown in order: capture, heartbeat, retry timers, transport, status.
    fn disconnect(&mut self, reason: &str) {
        self.stop_capture(true);
        self.stop_heartbeat();
        self.reconnect_timer = None;
        self.error_retry_timer = None;
        self.drop_transport(reason);
        self.reconnect.reset();
        self.mark_disconnected(Some(NORMAL_CLOSURE), reason.to_string());
    }

    /// Closes the live transport, if any, and invalidates everything tagged
    /// with the current generation.
    fn drop_transport(&mut self, reason: &str) {
        self.stop_heartbeat();
        self.handshake_deadline = None;
        self.generation += 1;
        if let Some(transport) = self.transport.take() {
            transport.sink.close(NORMAL_CLOSURE, reason);
            transport.reader.abort();
        }
        self.discard_backlog();
    }

    fn mark_disconnected(&mut self, code: Option<u16>, reason: String) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(SessionEvent::Disconnected { code, reason });
    }

    fn fail(&mut self, error: ProtocolError) {
        error!(code = %error.code, message = %error.message, recoverable = error.recoverable, "Session error");
        self.metrics.errors += 1;
        self.set_status(ConnectionStatus::Error);
        if error.recoverable {
            if let Some(delay) = self.options.error_retry_delay {
                info!(?delay, "Scheduling a retry of the failed connection");
                self.error_retry_timer = Some(Box::pin(tokio::time::sleep(delay)));
            }
        }
        self.emit(SessionEvent::Error(error));
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        let previous = self.status;
        self.status = status;
        self.status_tx.send_replace(status);
        debug!(%previous, %status, "Status changed");
        self.emit(SessionEvent::StatusChange { status, previous });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.transport.is_some()
    }

    /// Sends a frame if the transport is open; otherwise it is dropped.
    fn send_frame(&mut self, frame: OutboundFrame) -> bool {
        let Some(transport) = self.transport.as_ref() else {
            debug!(frame = frame.frame_type(), "No transport; frame dropped");
            return false;
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, frame = frame.frame_type(), "Failed to encode frame");
                return false;
            }
        };
        match transport.sink.send_text(text) {
            Ok(()) => true,
            Err(SendError::Full) => {
                warn!(frame = frame.frame_type(), "Transport queue full; frame dropped");
                false
            }
            Err(SendError::Closed) => {
                debug!(frame = frame.frame_type(), "Transport closed; frame dropped");
                false
            }
        }
    }

    // --- Heartbeat ---

    fn start_heartbeat(&mut self) {
        self.heartbeat.reset();
        let now = Instant::now();
        let mut ping = tokio::time::interval_at(now + self.options.heartbeat_interval, self.options.heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance =
            tokio::time::interval_at(now + self.options.quality_check_interval, self.options.quality_check_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ping_interval = Some(ping);
        self.maintenance_interval = Some(maintenance);
    }

    fn stop_heartbeat(&mut self) {
        self.ping_interval = None;
        self.maintenance_interval = None;
    }

    fn send_ping(&mut self) {
        if self.transport.is_none() {
            return;
        }
        self.heartbeat.record_ping(Instant::now());
        self.send_frame(OutboundFrame::Ping { timestamp: now_ms() });
    }

    /// Periodic work while a transport is live: quality, tool-call expiry,
    /// and draining the audio backlog.
    fn maintenance(&mut self) {
        let now = Instant::now();

        let quality = self.heartbeat.quality(now);
        if quality != self.quality {
            if quality == ConnectionQuality::Poor {
                warn!("Heartbeat missed; connection quality is poor");
            } else {
                info!(?quality, "Connection quality changed");
            }
            self.quality = quality;
            self.emit(SessionEvent::QualityChange(quality));
        }

        for call in self.tool_calls.evict_expired(now, self.options.tool_call_ttl) {
            warn!(id = %call.id, tool = %call.tool_type, "Tool call expired without a response");
            self.metrics.tool_calls_expired += 1;
            self.emit(SessionEvent::ToolCallExpired { id: call.id });
        }

        self.flush_backlog();
    }

    // --- Inbound frames ---

    fn on_text(&mut self, text: &str) {
        self.metrics.touch();
        let parsed = match protocol::parse_frame(text) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "Dropping malformed frame");
                self.metrics.errors += 1;
                self.emit(SessionEvent::Error(err));
                return;
            }
        };
        debug!(frame = %parsed.frame_type, "Frame received");

        match parsed.frame {
            InboundFrame::ConnectionEstablished { message, features } => {
                info!(?message, "Connection established");
                self.emit(SessionEvent::ConnectionEstablished { message, features });
            }
            InboundFrame::ContextLoaded { message, stats } => {
                info!(?message, "Context loaded");
                self.complete_handshake();
                self.emit(SessionEvent::ContextLoaded { message, stats });
            }
            InboundFrame::AiResponse {
                message,
                confidence,
                source,
                timestamp,
            } => {
                let mut metadata = Map::new();
                if let Some(confidence) = confidence {
                    metadata.insert("confidence".to_string(), confidence);
                }
                if let Some(source) = source {
                    metadata.insert("source".to_string(), source);
                }
                let mut reply = SessionMessage::new(MessageKind::Assistant, message).with_metadata(metadata);
                if let Some(ts) = timestamp.as_ref().and_then(protocol::timestamp_ms) {
                    reply = reply.with_timestamp(ts);
                }
                self.receive_message(reply);
            }
            InboundFrame::Pong => {
                self.heartbeat.record_pong(Instant::now());
                self.emit(SessionEvent::Pong);
            }
            InboundFrame::Heartbeat => self.heartbeat.record_pong(Instant::now()),
            InboundFrame::ContextError { message, details } => {
                let message = message.unwrap_or_else(|| "Context could not be loaded".to_string());
                warn!(%message, "Context error from service");
                self.metrics.errors += 1;
                let err = ProtocolError::new(codes::CONTEXT_ERROR, format!("Context error: {}", message), true)
                    .with_details(details);
                self.emit(SessionEvent::Error(err));
            }
            InboundFrame::ContextRefreshed { message } => {
                self.emit(SessionEvent::ContextRefreshed { message });
            }
            InboundFrame::Warning {
                message,
                received_type,
                details,
            } => {
                let message = message.unwrap_or_else(|| "Warning without details".to_string());
                warn!(%message, ?received_type, "Warning from service");
                self.emit(SessionEvent::Warning(ProtocolWarning {
                    message,
                    received_type,
                    details,
                    timestamp: now_ms(),
                }));
            }
            InboundFrame::Error {
                code,
                message,
                details,
                recoverable,
            } => {
                let err = ProtocolError::new(
                    code.unwrap_or_else(|| codes::UNKNOWN_ERROR.to_string()),
                    message.unwrap_or_else(|| "Unknown service error".to_string()),
                    recoverable.unwrap_or(true),
                )
                .with_details(details);
                error!(code = %err.code, message = %err.message, "Error from service");
                self.metrics.errors += 1;
                self.emit(SessionEvent::Error(err));
            }
            InboundFrame::Message { data } => self.receive_message(data),
            InboundFrame::Audio { data } => match pcm::decode_bytes(&data.audio) {
                Ok(pcm) => {
                    self.metrics.audio_chunks_received += 1;
                    self.audio.enqueue_playback(pcm.clone());
                    self.emit(SessionEvent::Audio(pcm));
                }
                Err(e) => {
                    warn!(error = %e, "Audio frame is not valid base64");
                    self.metrics.errors += 1;
                    self.emit(SessionEvent::Error(ProtocolError::new(
                        codes::INVALID_FRAME,
                        format!("Audio payload is not valid base64: {}", e),
                        true,
                    )));
                }
            },
            InboundFrame::ToolCall { data } => {
                info!(id = %data.id, tool = %data.tool_type, "Tool call received");
                if self.tool_calls.register(data.clone(), Instant::now()).is_some() {
                    warn!(id = %data.id, "Tool call id reused; previous call replaced");
                }
                self.emit(SessionEvent::ToolCall(data));
            }
            InboundFrame::ContextUpdate { data } => {
                self.context.merge(data);
                self.emit(SessionEvent::ContextUpdated(self.context.clone()));
            }
            InboundFrame::SessionReady => {
                info!("Session ready");
                self.complete_handshake();
            }
            InboundFrame::Unrecognized => {
                warn!(received_type = %parsed.frame_type, "Unrecognized frame type");
                self.emit(SessionEvent::Warning(ProtocolWarning {
                    message: format!("Unrecognized frame type `{}`", parsed.frame_type),
                    received_type: Some(parsed.frame_type),
                    details: None,
                    timestamp: now_ms(),
                }));
            }
        }
    }

    fn receive_message(&mut self, message: SessionMessage) {
        self.metrics.messages_received += 1;
        self.history.push(message.clone());
        self.emit(SessionEvent::Message(message));
    }

    // --- Caller operations ---

    fn send_message(&mut self, content: String, kind: MessageKind) -> Result<SessionMessage, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.metrics.touch();
        let message = SessionMessage::new(kind, content).with_context(ContextPatch::from(&self.context));
        self.send_frame(OutboundFrame::Message { data: message.clone() });
        self.metrics.messages_sent += 1;
        self.history.push(message.clone());
        self.emit(SessionEvent::MessageSent(message.clone()));
        Ok(message)
    }

    fn update_context(&mut self, patch: ContextPatch) -> EnterpriseContext {
        self.context.merge(patch);
        if self.is_connected() {
            self.send_frame(OutboundFrame::ContextUpdate {
                data: self.context.clone(),
            });
        }
        self.emit(SessionEvent::ContextUpdated(self.context.clone()));
        self.context.clone()
    }

    fn respond_to_tool_call(&mut self, response: ToolCallResponse) -> bool {
        let Some(call) = self.tool_calls.take(&response.id) else {
            warn!(id = %response.id, "No pending tool call with this id");
            return false;
        };
        debug!(id = %call.id, tool = %call.tool_type, success = response.success, "Answering tool call");
        if !self.send_frame(OutboundFrame::ToolCallResponse { data: response.clone() }) {
            warn!(id = %call.id, "Tool call response could not be delivered");
        }
        self.emit(SessionEvent::ToolCallResponse(response));
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            session_id: self.session_id.clone(),
            context: self.context.clone(),
            quality: self.quality,
            metrics: self.metrics.clone(),
            history_len: self.history.len(),
            pending_tool_calls: self.tool_calls.len(),
            reconnect_attempts: self.reconnect.attempts(),
            audio_streaming: !matches!(self.capture, Capture::Idle),
        }
    }

    // --- Audio ---

    fn start_audio(&mut self, reply: oneshot::Sender<Result<(), SessionError>>) {
        if !self.is_connected() {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        }
        if !matches!(self.capture, Capture::Idle) {
            debug!("Audio capture already running");
            let _ = reply.send(Ok(()));
            return;
        }
        self.capture_epoch += 1;
        self.capture = Capture::Starting;

        let epoch = self.capture_epoch;
        let constraints = CaptureConstraints::from(&self.options.audio);
        let audio = self.audio.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = audio.start_input(constraints).await;
            let _ = internal.send(Internal::CaptureStarted { epoch, result, reply }).await;
        });
    }

    fn on_capture_started(
        &mut self,
        epoch: u64,
        result: Result<mpsc::Receiver<AudioEngineEvent>, AudioCaptureError>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    ) {
        let current = epoch == self.capture_epoch && matches!(self.capture, Capture::Starting);
        if !current || !self.is_connected() {
            if current {
                self.capture = Capture::Idle;
            }
            // A newer capture may be starting; only release an idle device.
            if result.is_ok() && matches!(self.capture, Capture::Idle) {
                self.audio.stop_input();
            }
            let err = if self.is_connected() {
                SessionError::AudioCapture(AudioCaptureError::Engine("Capture was cancelled".to_string()))
            } else {
                SessionError::NotConnected
            };
            let _ = reply.send(Err(err));
            return;
        }

        let mut engine_events = match result {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Audio capture failed to start");
                self.capture = Capture::Idle;
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let internal = self.internal_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = engine_events.recv().await {
                if internal.send(Internal::Audio { epoch, event }).await.is_err() {
                    return;
                }
            }
            let _ = internal.send(Internal::CaptureEnded { epoch }).await;
        });
        self.capture = Capture::Active { forwarder };

        info!(sample_rate = self.options.audio.sample_rate, "Audio streaming started");
        self.send_frame(OutboundFrame::AudioStreamStart {
            data: AudioStreamStartData {
                session_id: self.session_id.clone(),
                sample_rate: self.options.audio.sample_rate,
            },
        });
        self.emit(SessionEvent::AudioStreamStarted);
        let _ = reply.send(Ok(()));
    }

    fn on_audio(&mut self, event: AudioEngineEvent) {
        match event {
            AudioEngineEvent::Volume(volume) => self.emit(SessionEvent::Volume(volume)),
            AudioEngineEvent::SpeechState(state) => self.emit(SessionEvent::SpeechState(state)),
            AudioEngineEvent::Chunk(chunk) => {
                if !self.is_connected() {
                    return;
                }
                let frame = OutboundFrame::AudioChunk {
                    data: AudioChunkData {
                        audio: pcm::encode_i16(&chunk.samples),
                        sample_rate: chunk.sample_rate,
                        timestamp: chunk.timestamp,
                    },
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to encode audio chunk");
                        return;
                    }
                };
                if self.backlog.push(text) {
                    self.metrics.audio_chunks_dropped += 1;
                    warn!(dropped = self.metrics.audio_chunks_dropped, "Audio backlog full; oldest chunk dropped");
                }
                self.flush_backlog();
            }
        }
    }

    fn flush_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let outcome = self.backlog.flush(transport.sink.as_ref());
        self.metrics.audio_chunks_sent += outcome.sent as u64;
        if outcome.dropped > 0 {
            self.metrics.audio_chunks_dropped += outcome.dropped as u64;
            warn!(dropped = outcome.dropped, "Transport refused queued audio chunks");
        }
    }

    fn discard_backlog(&mut self) {
        let discarded = self.backlog.clear();
        if discarded > 0 {
            self.metrics.audio_chunks_dropped += discarded as u64;
            warn!(discarded, "Queued audio chunks discarded");
        }
    }

    /// Stops capture if running. `notify_peer` sends `audioStreamStop` when
    /// the session is still connected.
    fn stop_capture(&mut self, notify_peer: bool) {
        let previous = std::mem::replace(&mut self.capture, Capture::Idle);
        match previous {
            Capture::Idle => return,
            Capture::Starting => {}
            Capture::Active { forwarder } => forwarder.abort(),
        }
        self.capture_epoch += 1;
        self.audio.stop_input();
        self.flush_backlog();
        self.discard_backlog();
        if notify_peer && self.is_connected() {
            self.send_frame(OutboundFrame::AudioStreamStop {
                data: AudioStreamStopData {
                    session_id: self.session_id.clone(),
                },
            });
        }
        info!("Audio streaming stopped");
        self.emit(SessionEvent::AudioStreamStopped);
    }
}

async fn sleep_opt(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}
