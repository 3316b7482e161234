//! The seam between the session actor and a concrete socket.
//!
//! A [`Connector`] opens one [`Connection`] per attempt. The actor writes
//! through the non-blocking [`TransportSink`] and reads [`TransportEvent`]s
//! from a channel; the socket itself is driven by a task owned by the
//! connector implementation.

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the socket ends without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub credentials: SecretString,
}

/// What the socket reports back. `Closed` is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("transport send queue is full")]
    Full,
    #[error("transport is closed")]
    Closed,
}

pub trait TransportSink: Send + Sync {
    /// Queues a text frame without waiting.
    fn send_text(&self, text: String) -> Result<(), SendError>;

    /// Whether a `send_text` issued now would be accepted.
    fn has_capacity(&self) -> bool;

    /// Requests a close handshake. Idempotent.
    fn close(&self, code: u16, reason: &str);

    fn is_open(&self) -> bool;
}

/// A live transport: the write half and the event stream.
pub struct Connection {
    pub sink: Box<dyn TransportSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.sink.is_open())
            .finish()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError>;
}

/// Frames the actor asked the socket task to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// The socket-task side of a channel-backed [`Connection`].
pub struct RemoteEnd {
    pub outgoing: mpsc::Receiver<Outgoing>,
    pub events: mpsc::Sender<TransportEvent>,
}

impl Connection {
    /// Builds a connection backed by two bounded channels. The caller drives
    /// the returned [`RemoteEnd`] with a real socket, or with a test script.
    pub fn channel(capacity: usize) -> (Connection, RemoteEnd) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let connection = Connection {
            sink: Box::new(ChannelSink::new(outgoing_tx)),
            events: events_rx,
        };
        let remote = RemoteEnd {
            outgoing: outgoing_rx,
            events: events_tx,
        };
        (connection, remote)
    }
}

/// [`TransportSink`] over a bounded `mpsc` queue.
pub struct ChannelSink {
    tx: mpsc::Sender<Outgoing>,
    closing: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            tx,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl TransportSink for ChannelSink {
    fn send_text(&self, text: String) -> Result<(), SendError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.tx.try_send(Outgoing::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn has_capacity(&self) -> bool {
        self.is_open() && self.tx.capacity() > 0
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = Outgoing::Close {
            code,
            reason: reason.to_string(),
        };
        if let Err(mpsc::error::TrySendError::Full(frame)) = self.tx.try_send(frame) {
            // The queue is saturated; deliver the close once it drains.
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(frame).await;
            });
        }
    }

    fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}
