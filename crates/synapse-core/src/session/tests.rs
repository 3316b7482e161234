use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::audio::{AudioChunk, AudioEngineEvent, MockAudioEngine, pcm};
use crate::context::UserRole;
use crate::error::{AudioCaptureError, TransportError, codes};
use crate::transport::{
    ConnectRequest, Connection, Outgoing, RemoteEnd, SendError, TransportEvent, TransportSink,
};

type Log = Arc<Mutex<Vec<String>>>;

/// Wraps a sink and records the `type` of every frame sent plus closes.
struct RecordingSink {
    inner: Box<dyn TransportSink>,
    log: Log,
}

impl TransportSink for RecordingSink {
    fn send_text(&self, text: String) -> Result<(), SendError> {
        let frame_type = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_default();
        self.log.lock().unwrap().push(format!("send:{}", frame_type));
        self.inner.send_text(text)
    }

    fn has_capacity(&self) -> bool {
        self.inner.has_capacity()
    }

    fn close(&self, code: u16, reason: &str) {
        self.log.lock().unwrap().push(format!("close:{}", code));
        self.inner.close(code, reason)
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

enum Step {
    Accept,
    Fail(TransportError),
    AcceptAfter(Duration),
}

struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    connects: AtomicUsize,
    log: Log,
}

impl ScriptedConnector {
    fn accept(&self) -> Connection {
        let (connection, remote) = Connection::channel(64);
        let _ = self.remotes.send(remote);
        Connection {
            sink: Box::new(RecordingSink {
                inner: connection.sink,
                log: self.log.clone(),
            }),
            events: connection.events,
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        assert_eq!(request.url, "wss://demo.example.co/functions/v1/synapse-live-voice");
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Accept);
        match step {
            Step::Accept => Ok(self.accept()),
            Step::Fail(e) => Err(e),
            Step::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept())
            }
        }
    }
}

struct Harness {
    handle: SessionHandle,
    connector: Arc<ScriptedConnector>,
    remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    events: broadcast::Receiver<SessionEvent>,
    log: Log,
}

impl Harness {
    fn connects(&self) -> usize {
        self.connector.connects.load(Ordering::SeqCst)
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Connects and waits for the transport to open and `init_context` to arrive.
    async fn open(&mut self) -> RemoteEnd {
        self.handle.connect().await.unwrap();
        self.next_remote().await
    }

    async fn next_remote(&mut self) -> RemoteEnd {
        let mut remote = self.remotes.recv().await.expect("connector dropped");
        let init = next_frame(&mut remote).await;
        assert_eq!(init["type"], "init_context");
        remote
    }

    /// Full two-phase handshake.
    async fn handshake(&mut self) -> RemoteEnd {
        let remote = self.open().await;
        push(&remote, json!({"type": "context_loaded", "message": "ready"})).await;
        self.handle.wait_for_status(ConnectionStatus::Connected).await.unwrap();
        remote
    }

    async fn next_event(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let wait = async {
            loop {
                let event = self.events.recv().await.expect("event stream closed");
                if matches(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("event never arrived")
    }
}

fn options() -> SessionOptions {
    SessionOptions::new(
        "https://demo.example.co",
        SecretString::from("anon-key".to_string()),
        EnterpriseContext::new("u-1", UserRole::Employee, "ctx-1"),
    )
}

fn quiet_audio() -> MockAudioEngine {
    let mut audio = MockAudioEngine::new();
    audio.expect_stop_input().return_const(());
    audio.expect_enqueue_playback().return_const(());
    audio
}

fn harness_with(options: SessionOptions, steps: Vec<Step>, audio: MockAudioEngine) -> Harness {
    harness_logged(options, steps, audio, Arc::default())
}

/// Like `harness_with`, recording transport activity into `log`.
fn harness_logged(options: SessionOptions, steps: Vec<Step>, audio: MockAudioEngine, log: Log) -> Harness {
    let (remotes_tx, remotes) = mpsc::unbounded_channel();
    let connector = Arc::new(ScriptedConnector {
        steps: Mutex::new(steps.into()),
        remotes: remotes_tx,
        connects: AtomicUsize::new(0),
        log: log.clone(),
    });
    let handle = SessionHandle::spawn(options, connector.clone(), Arc::new(audio)).unwrap();
    let events = handle.subscribe();
    Harness {
        handle,
        connector,
        remotes,
        events,
        log,
    }
}

fn harness() -> Harness {
    harness_with(options(), Vec::new(), quiet_audio())
}

async fn push(remote: &RemoteEnd, frame: Value) {
    remote
        .events
        .send(TransportEvent::Text(frame.to_string()))
        .await
        .unwrap();
}

async fn close_from_peer(remote: &RemoteEnd, code: u16) {
    remote
        .events
        .send(TransportEvent::Closed {
            code,
            reason: "peer".into(),
        })
        .await
        .unwrap();
}

/// Next frame written by the session, pings included. A close is reported
/// as `{"type": "__close", "code": ..}`.
async fn next_frame(remote: &mut RemoteEnd) -> Value {
    match remote.outgoing.recv().await.expect("transport dropped") {
        Outgoing::Text(text) => serde_json::from_str(&text).unwrap(),
        Outgoing::Close { code, .. } => json!({"type": "__close", "code": code}),
    }
}

async fn next_non_ping(remote: &mut RemoteEnd) -> Value {
    loop {
        let frame = next_frame(remote).await;
        if frame["type"] != "ping" {
            return frame;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let mut h = harness();
    h.handle.connect().await.unwrap();
    h.handle.connect().await.unwrap();
    assert_eq!(h.handle.status(), ConnectionStatus::Connecting);

    let remote = h.next_remote().await;
    push(&remote, json!({"type": "context_loaded"})).await;
    h.handle.wait_for_status(ConnectionStatus::Connected).await.unwrap();

    h.handle.connect().await.unwrap();
    assert_eq!(h.connects(), 1);
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connection_established_does_not_complete_handshake() {
    let mut h = harness();
    let remote = h.open().await;
    push(&remote, json!({"type": "connection_established", "features": ["voice"]})).await;
    h.next_event(|e| matches!(e, SessionEvent::ConnectionEstablished { .. })).await;
    assert_eq!(h.handle.status(), ConnectionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_context_loaded_emits_connected_once() {
    let mut h = harness();
    let remote = h.handshake().await;
    push(&remote, json!({"type": "context_loaded"})).await;
    push(&remote, json!({"type": "pong"})).await;

    let mut connected = 0;
    let mut loaded = 0;
    loop {
        match h.next_event(|_| true).await {
            SessionEvent::Connected => connected += 1,
            SessionEvent::ContextLoaded { .. } => loaded += 1,
            SessionEvent::Pong => break,
            _ => {}
        }
    }
    assert_eq!(connected, 1);
    assert_eq!(loaded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_session_ready_completes_handshake() {
    let mut h = harness();
    let remote = h.open().await;
    push(&remote, json!({"type": "session_ready"})).await;
    h.handle.wait_for_status(ConnectionStatus::Connected).await.unwrap();
    h.next_event(|e| matches!(e, SessionEvent::Connected)).await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_frame_type_becomes_warning() {
    let mut h = harness();
    let remote = h.handshake().await;
    push(&remote, json!({"type": "bogus_type", "x": 1})).await;

    match h.next_event(|e| matches!(e, SessionEvent::Warning(_))).await {
        SessionEvent::Warning(warning) => {
            assert_eq!(warning.received_type.as_deref(), Some("bogus_type"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_emits_invalid_frame_error() {
    let mut h = harness();
    let remote = h.handshake().await;
    remote
        .events
        .send(TransportEvent::Text("{not json".into()))
        .await
        .unwrap();

    match h.next_event(|e| matches!(e, SessionEvent::Error(_))).await {
        SessionEvent::Error(err) => {
            assert_eq!(err.code, codes::INVALID_FRAME);
            assert!(err.recoverable);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_service_errors_keep_status() {
    let mut h = harness();
    let remote = h.handshake().await;
    push(&remote, json!({"type": "context_error", "message": "no company"})).await;
    match h.next_event(|e| matches!(e, SessionEvent::Error(_))).await {
        SessionEvent::Error(err) => {
            assert_eq!(err.code, codes::CONTEXT_ERROR);
            assert!(err.recoverable);
        }
        other => panic!("unexpected event {:?}", other),
    }

    push(&remote, json!({"type": "error", "message": "quota", "recoverable": false})).await;
    match h.next_event(|e| matches!(e, SessionEvent::Error(_))).await {
        SessionEvent::Error(err) => {
            assert_eq!(err.code, codes::UNKNOWN_ERROR);
            assert!(!err.recoverable);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
    assert_eq!(h.handle.metrics().await.unwrap().errors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_tool_call_response_round_trip() {
    let mut h = harness();
    let mut remote = h.handshake().await;
    push(
        &remote,
        json!({"type": "toolCall", "data": {"id": "t1", "type": "lookup_invoice", "parameters": {"number": 42}}}),
    )
    .await;
    h.next_event(|e| matches!(e, SessionEvent::ToolCall(_))).await;
    assert_eq!(h.handle.pending_tool_calls().await.unwrap().len(), 1);

    assert!(h.handle.respond_to_tool_call("t1", json!({"total": 99})).await.unwrap());
    let frame = next_non_ping(&mut remote).await;
    assert_eq!(frame["type"], "toolCallResponse");
    assert_eq!(frame["data"]["id"], "t1");
    assert_eq!(frame["data"]["success"], true);
    assert_eq!(frame["data"]["data"]["total"], 99);
    assert!(h.handle.pending_tool_calls().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_call_id_is_noop() {
    let mut h = harness();
    let mut remote = h.handshake().await;
    push(&remote, json!({"type": "toolCall", "data": {"id": "t1", "type": "lookup"}})).await;
    h.next_event(|e| matches!(e, SessionEvent::ToolCall(_))).await;

    assert!(!h.handle.respond_to_tool_call("nope", json!(null)).await.unwrap());
    assert_eq!(h.handle.pending_tool_calls().await.unwrap().len(), 1);
    assert!(!h.log().iter().any(|e| e == "send:toolCallResponse"));

    assert!(h.handle.reject_tool_call("t1", "not allowed").await.unwrap());
    let frame = next_non_ping(&mut remote).await;
    assert_eq!(frame["data"]["success"], false);
    assert_eq!(frame["data"]["error"], "not allowed");
}

#[tokio::test(start_paused = true)]
async fn test_tool_calls_expire_after_ttl() {
    let mut opts = options();
    opts.tool_call_ttl = Duration::from_secs(20);
    let mut h = harness_with(opts, Vec::new(), quiet_audio());
    let remote = h.handshake().await;
    push(&remote, json!({"type": "toolCall", "data": {"id": "t9", "type": "slow"}})).await;
    h.next_event(|e| matches!(e, SessionEvent::ToolCall(_))).await;

    match h.next_event(|e| matches!(e, SessionEvent::ToolCallExpired { .. })).await {
        SessionEvent::ToolCallExpired { id } => assert_eq!(id, "t9"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.handle.pending_tool_calls().await.unwrap().is_empty());
    assert_eq!(h.handle.metrics().await.unwrap().tool_calls_expired, 1);
    assert!(!h.handle.respond_to_tool_call("t9", json!({})).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_history_is_append_only_until_cleared() {
    let mut h = harness();
    assert_eq!(
        h.handle.send_message("too early", MessageKind::User).await,
        Err(SessionError::NotConnected)
    );

    let mut remote = h.handshake().await;
    let sent = h.handle.send_message("hello", MessageKind::User).await.unwrap();
    let frame = next_non_ping(&mut remote).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["data"]["content"], "hello");
    assert_eq!(frame["data"]["type"], "user");
    assert_eq!(frame["data"]["context"]["userId"], "u-1");

    push(
        &remote,
        json!({"type": "ai_response", "message": "hi there", "confidence": 0.9, "source": "kb", "timestamp": "2024-01-01T00:00:00Z"}),
    )
    .await;
    h.next_event(|e| matches!(e, SessionEvent::Message(_))).await;

    let history = h.handle.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], sent);
    assert_eq!(history[1].kind, MessageKind::Assistant);
    assert_eq!(history[1].content, "hi there");
    assert_eq!(history[1].timestamp, 1_704_067_200_000);
    let metadata = history[1].metadata.as_ref().unwrap();
    assert_eq!(metadata["confidence"], 0.9);
    assert_eq!(metadata["source"], "kb");

    h.handle.clear_history().await.unwrap();
    assert!(h.handle.history().await.unwrap().is_empty());

    let metrics = h.handle.metrics().await.unwrap();
    assert_eq!(metrics.messages_sent, 1);
    assert_eq!(metrics.messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_pongs_degrade_quality_without_status_change() {
    let mut h = harness();
    let _remote = h.handshake().await;
    assert_eq!(h.handle.quality().await.unwrap(), ConnectionQuality::Good);

    tokio::time::sleep(Duration::from_secs(45)).await;

    assert_eq!(h.handle.quality().await.unwrap(), ConnectionQuality::Poor);
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
    h.next_event(|e| matches!(e, SessionEvent::QualityChange(ConnectionQuality::Poor)))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_prompt_pongs_rate_quality_excellent() {
    let mut h = harness();
    let mut remote = h.handshake().await;
    let ping = next_frame(&mut remote).await;
    assert_eq!(ping["type"], "ping");
    push(&remote, json!({"type": "pong"})).await;

    h.next_event(|e| matches!(e, SessionEvent::QualityChange(ConnectionQuality::Excellent)))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_audio_before_closing_transport() {
    let log: Log = Arc::default();
    let (engine_tx, engine_rx) = mpsc::channel(8);
    let mut audio = MockAudioEngine::new();
    audio
        .expect_start_input()
        .times(1)
        .return_once(move |constraints| {
            assert_eq!(constraints.sample_rate, 16000);
            assert_eq!(constraints.channel_count, 1);
            assert!(constraints.echo_cancellation);
            Ok(engine_rx)
        });
    let stop_log = log.clone();
    audio
        .expect_stop_input()
        .times(1)
        .returning(move || stop_log.lock().unwrap().push("stop_input".to_string()));

    let mut h = harness_logged(options(), Vec::new(), audio, log);

    let mut remote = h.handshake().await;
    h.handle.start_audio_stream().await.unwrap();
    h.handle.start_audio_stream().await.unwrap();

    let start = next_non_ping(&mut remote).await;
    assert_eq!(start["type"], "audioStreamStart");
    assert_eq!(start["data"]["sampleRate"], 16000);

    engine_tx
        .send(AudioEngineEvent::Chunk(AudioChunk {
            samples: vec![256, -2],
            sample_rate: 16000,
            timestamp: 7,
        }))
        .await
        .unwrap();
    let chunk = next_non_ping(&mut remote).await;
    assert_eq!(chunk["type"], "audioChunk");
    assert_eq!(chunk["data"]["audio"], pcm::encode_i16(&[256, -2]));
    assert_eq!(chunk["data"]["timestamp"], 7);

    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);

    let stop = next_non_ping(&mut remote).await;
    assert_eq!(stop["type"], "audioStreamStop");
    let close = next_non_ping(&mut remote).await;
    assert_eq!(close, json!({"type": "__close", "code": 1000}));

    let log = h.log();
    let at = |entry: &str| {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} missing from {:?}", entry, log))
    };
    assert!(at("stop_input") < at("send:audioStreamStop"));
    assert!(at("send:audioStreamStop") < at("close:1000"));
    assert_eq!(h.handle.metrics().await.unwrap().audio_chunks_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_audio_requires_connection_and_reports_capture_failure() {
    let mut audio = MockAudioEngine::new();
    audio
        .expect_start_input()
        .times(1)
        .returning(|_| Err(AudioCaptureError::PermissionDenied));
    audio.expect_stop_input().return_const(());

    let mut h = harness_with(options(), Vec::new(), audio);
    assert_eq!(h.handle.start_audio_stream().await, Err(SessionError::NotConnected));

    let _remote = h.handshake().await;
    assert_eq!(
        h.handle.start_audio_stream().await,
        Err(SessionError::AudioCapture(AudioCaptureError::PermissionDenied))
    );
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
    assert!(!h.handle.snapshot().await.unwrap().audio_streaming);

    // Stopping while idle is a no-op.
    h.handle.stop_audio_stream().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_inbound_audio_is_queued_for_playback() {
    let mut audio = MockAudioEngine::new();
    audio
        .expect_enqueue_playback()
        .withf(|pcm| pcm[..] == [0x00u8, 0x01, 0xFE, 0xFF])
        .times(1)
        .return_const(());
    audio.expect_stop_input().return_const(());

    let mut h = harness_with(options(), Vec::new(), audio);
    let remote = h.handshake().await;
    push(&remote, json!({"type": "audio", "data": {"audio": pcm::encode_i16(&[256, -2])}})).await;
    h.next_event(|e| matches!(e, SessionEvent::Audio(_))).await;
    assert_eq!(h.handle.metrics().await.unwrap().audio_chunks_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_volume_is_clamped_and_passed_to_engine() {
    let mut audio = quiet_audio();
    audio
        .expect_set_input_volume()
        .withf(|volume| *volume == 0.25)
        .times(1)
        .return_const(());
    audio
        .expect_set_output_volume()
        .withf(|volume| *volume == 1.0)
        .times(1)
        .return_const(());
    audio
        .expect_set_output_volume()
        .withf(|volume| *volume == 0.0)
        .times(2)
        .return_const(());

    // No connection is needed to adjust gains.
    let h = harness_with(options(), Vec::new(), audio);
    assert_eq!(h.handle.set_input_volume(0.25).await.unwrap(), 0.25);
    assert_eq!(h.handle.set_output_volume(3.0).await.unwrap(), 1.0);
    assert_eq!(h.handle.set_output_volume(-1.0).await.unwrap(), 0.0);
    assert_eq!(h.handle.set_output_volume(f32::NAN).await.unwrap(), 0.0);
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut opts = options();
    opts.max_reconnect_attempts = 2;
    opts.reconnect_delay = Duration::from_millis(100);
    opts.error_retry_delay = Some(Duration::from_secs(1));
    let steps = vec![
        Step::Accept,
        Step::Fail(TransportError::Connect("refused".into())),
        Step::Fail(TransportError::Connect("refused".into())),
    ];
    let mut h = harness_with(opts, steps, quiet_audio());
    let remote = h.handshake().await;
    close_from_peer(&remote, 1006).await;

    let mut delays = Vec::new();
    let error = loop {
        match h.next_event(|_| true).await {
            SessionEvent::Reconnecting { attempt, delay } => delays.push((attempt, delay)),
            SessionEvent::Error(err) => break err,
            _ => {}
        }
    };
    assert_eq!(
        delays,
        vec![(1, Duration::from_millis(100)), (2, Duration::from_millis(200))]
    );
    assert_eq!(error.code, codes::MAX_RECONNECT_ATTEMPTS);
    assert!(!error.recoverable);
    assert_eq!(h.handle.status(), ConnectionStatus::Error);
    assert_eq!(h.connects(), 3);
    assert_eq!(h.handle.metrics().await.unwrap().reconnections, 2);

    // Giving up is terminal even with error retries enabled.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connects(), 3);
    assert_eq!(h.handle.status(), ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_and_resets_attempts() {
    let mut h = harness();
    let remote = h.handshake().await;
    let first_session = h.handle.session_id().await.unwrap();
    push(&remote, json!({"type": "toolCall", "data": {"id": "keep", "type": "lookup"}})).await;
    h.next_event(|e| matches!(e, SessionEvent::ToolCall(_))).await;

    close_from_peer(&remote, 4000).await;
    h.handle.wait_for_status(ConnectionStatus::Reconnecting).await.unwrap();

    let second = h.next_remote().await;
    push(&second, json!({"type": "context_loaded"})).await;
    h.handle.wait_for_status(ConnectionStatus::Connected).await.unwrap();

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.metrics.reconnections, 1);
    assert_eq!(snapshot.pending_tool_calls, 1);
    assert_ne!(snapshot.session_id, first_session);
    assert_eq!(h.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_normal_closure_disconnects_without_retry() {
    let mut h = harness();
    let remote = h.handshake().await;
    close_from_peer(&remote, 1000).await;

    match h.next_event(|e| matches!(e, SessionEvent::Disconnected { .. })).await {
        SessionEvent::Disconnected { code, .. } => assert_eq!(code, Some(1000)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_closure_without_auto_reconnect_disconnects() {
    let mut opts = options();
    opts.auto_reconnect = false;
    let mut h = harness_with(opts, Vec::new(), quiet_audio());
    let remote = h.handshake().await;
    close_from_peer(&remote, 1006).await;
    h.handle.wait_for_status(ConnectionStatus::Disconnected).await.unwrap();
    assert_eq!(h.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_recoverable_error() {
    let steps = vec![Step::Fail(TransportError::Connect("refused".into()))];
    let mut h = harness_with(options(), steps, quiet_audio());
    h.handle.connect().await.unwrap();

    match h.next_event(|e| matches!(e, SessionEvent::Error(_))).await {
        SessionEvent::Error(err) => {
            assert_eq!(err.code, codes::CONNECTION_ERROR);
            assert!(err.recoverable);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.handle.status(), ConnectionStatus::Error);

    // Without an error retry delay the caller decides when to try again.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connects(), 1);

    let _remote = h.handshake().await;
    assert_eq!(h.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_failure_is_retried_when_enabled() {
    let mut opts = options();
    opts.error_retry_delay = Some(Duration::from_secs(5));
    let steps = vec![Step::Fail(TransportError::Connect("refused".into()))];
    let mut h = harness_with(opts, steps, quiet_audio());
    h.handle.connect().await.unwrap();
    h.handle.wait_for_status(ConnectionStatus::Error).await.unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.connects(), 1);

    let remote = h.next_remote().await;
    push(&remote, json!({"type": "context_loaded"})).await;
    h.handle.wait_for_status(ConnectionStatus::Connected).await.unwrap();
    assert_eq!(h.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_error_retry() {
    let mut opts = options();
    opts.error_retry_delay = Some(Duration::from_secs(5));
    let steps = vec![Step::Fail(TransportError::Connect("refused".into()))];
    let h = harness_with(opts, steps, quiet_audio());
    h.handle.connect().await.unwrap();
    h.handle.wait_for_status(ConnectionStatus::Error).await.unwrap();

    h.handle.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connects(), 1);
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_late_open_from_timed_out_attempt_is_closed() {
    let steps = vec![Step::AcceptAfter(Duration::from_secs(15))];
    let mut h = harness_with(options(), steps, quiet_audio());
    h.handle.connect().await.unwrap();

    match h.next_event(|e| matches!(e, SessionEvent::Error(_))).await {
        SessionEvent::Error(err) => assert_eq!(err.code, codes::HANDSHAKE_TIMEOUT),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.handle.status(), ConnectionStatus::Error);

    let mut late = h.remotes.recv().await.unwrap();
    assert_eq!(next_frame(&mut late).await, json!({"type": "__close", "code": 1000}));
    assert!(!h.log().iter().any(|e| e == "send:init_context"));
    assert_eq!(h.handle.status(), ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_reconnecting_restarts_attempts() {
    let mut opts = options();
    opts.reconnect_delay = Duration::from_secs(30);
    let mut h = harness_with(opts, Vec::new(), quiet_audio());
    let remote = h.handshake().await;
    close_from_peer(&remote, 1006).await;
    h.handle.wait_for_status(ConnectionStatus::Reconnecting).await.unwrap();
    assert_eq!(h.handle.snapshot().await.unwrap().reconnect_attempts, 1);

    h.handle.connect().await.unwrap();
    assert_eq!(h.handle.status(), ConnectionStatus::Connecting);
    assert_eq!(h.handle.snapshot().await.unwrap().reconnect_attempts, 0);

    let second = h.next_remote().await;
    push(&second, json!({"type": "context_loaded"})).await;
    h.handle.wait_for_status(ConnectionStatus::Connected).await.unwrap();
    assert_eq!(h.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_update_context_merges_and_syncs() {
    let mut h = harness();
    let offline = h.handle.update_context(ContextPatch::company_name("Draft")).await.unwrap();
    assert_eq!(offline.company_name.as_deref(), Some("Draft"));

    let mut remote = h.handshake().await;
    let ctx = h.handle.update_context(ContextPatch::company_name("Acme")).await.unwrap();
    assert_eq!(ctx.company_name.as_deref(), Some("Acme"));
    assert_eq!(ctx.user_id, "u-1");

    let frame = next_non_ping(&mut remote).await;
    assert_eq!(frame["type"], "contextUpdate");
    assert_eq!(frame["data"]["companyName"], "Acme");
    assert_eq!(frame["data"]["userId"], "u-1");
    assert_eq!(h.log().iter().filter(|e| *e == "send:contextUpdate").count(), 1);

    // Updates from the service merge without an echo.
    push(&remote, json!({"type": "contextUpdate", "data": {"companyId": "c-7"}})).await;
    h.next_event(|e| matches!(e, SessionEvent::ContextUpdated(ctx) if ctx.company_id.is_some()))
        .await;
    let ctx = h.handle.context().await.unwrap();
    assert_eq!(ctx.company_id.as_deref(), Some("c-7"));
    assert_eq!(ctx.company_name.as_deref(), Some("Acme"));
    assert_eq!(h.log().iter().filter(|e| *e == "send:contextUpdate").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_closes_transport() {
    let mut h = harness();
    let mut remote = h.handshake().await;
    let clone = h.handle.clone();
    drop(clone);
    drop(h.handle);

    assert_eq!(next_non_ping(&mut remote).await, json!({"type": "__close", "code": 1000}));
}

#[tokio::test]
async fn test_spawn_rejects_invalid_options() {
    let mut opts = options();
    opts.service_url = "ftp://nowhere".into();
    let (remotes, _rx) = mpsc::unbounded_channel();
    let connector = Arc::new(ScriptedConnector {
        steps: Mutex::default(),
        remotes,
        connects: AtomicUsize::new(0),
        log: Arc::default(),
    });
    let result = SessionHandle::spawn(opts, connector, Arc::new(quiet_audio()));
    assert!(matches!(result, Err(ConfigError::InvalidServiceUrl(_))));
}
