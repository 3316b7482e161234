//! WebSocket [`Connector`] for the Synapse session service, built on
//! `tokio-tungstenite`.
//!
//! Each connection gets a pump task that owns the socket: it writes frames
//! queued by the session and forwards everything the service sends back as
//! [`TransportEvent`]s, ending with exactly one `Closed`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, info, warn};

use synapse_core::error::TransportError;
use synapse_core::transport::{
    ABNORMAL_CLOSURE, ConnectRequest, Connection, Connector, NORMAL_CLOSURE, Outgoing, RemoteEnd,
    TransportEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the service to answer our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct WebSocketConnector {
    queue_capacity: usize,
}

impl WebSocketConnector {
    /// `queue_capacity` bounds both the outbound frame queue and the inbound
    /// event queue of every connection.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        let key = request.credentials.expose_secret();
        let headers = ws_request.headers_mut();
        headers.insert(
            "apikey",
            HeaderValue::from_str(key).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?,
        );

        let (stream, response) = connect_async(ws_request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(status = %response.status(), "Connected to Synapse WebSocket.");

        let (connection, remote) = Connection::channel(self.queue_capacity);
        let span = tracing::debug_span!("synapse_socket", url = %request.url);
        tokio::spawn(pump(stream, remote).instrument(span));
        Ok(connection)
    }
}

/// Drives one socket until either side closes it.
async fn pump(stream: WsStream, remote: RemoteEnd) {
    let RemoteEnd {
        mut outgoing,
        events,
    } = remote;
    let (mut ws_tx, mut ws_rx) = stream.split();

    let (code, reason) = loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(error = %e, "Failed to write to Synapse WebSocket");
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    close_locally(&mut ws_tx, &mut ws_rx, code, &reason).await;
                    break (code, reason);
                }
                None => {
                    // The session let go of this connection without closing it.
                    close_locally(&mut ws_tx, &mut ws_rx, NORMAL_CLOSURE, "").await;
                    return;
                }
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Text(text.as_str().to_owned())).await.is_err() {
                        close_locally(&mut ws_tx, &mut ws_rx, NORMAL_CLOSURE, "").await;
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = ws_tx.close().await;
                    break match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (u16::from(CloseCode::Status), String::new()),
                    };
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "Ignoring binary frame from Synapse WebSocket");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Error reading from Synapse WebSocket");
                    break (ABNORMAL_CLOSURE, e.to_string());
                }
                None => break (ABNORMAL_CLOSURE, "Connection dropped".to_string()),
            },
        }
    };

    debug!(code, %reason, "Synapse WebSocket closed");
    let _ = events.send(TransportEvent::Closed { code, reason }).await;
}

/// Sends a close frame and waits briefly for the service's acknowledgement.
async fn close_locally(
    ws_tx: &mut SplitSink<WsStream, Message>,
    ws_rx: &mut SplitStream<WsStream>,
    code: u16,
    reason: &str,
) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Close frame not delivered");
        return;
    }
    let acknowledged = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(message)) = ws_rx.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if acknowledged.is_err() {
        debug!("Synapse WebSocket did not acknowledge close in time");
    }
}
