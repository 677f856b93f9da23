//! Live audio websocket transport.
//!
//! Protocol:
//! 1. Connect via WebSocket to the bidirectional streaming endpoint with the
//!    API key in the `x-goog-api-key` header
//! 2. Send the `setup` message (model, voice, system instruction, tools)
//! 3. Wait for `setupComplete`, then report the session open
//! 4. Stream `realtimeInput` audio frames out and `serverContent` audio in
//!
//! Reading and writing run as two tasks so a slow socket never stalls the
//! inbound path, and the capture side only ever touches a bounded queue.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::audio::OutboundFrame;
use crate::error::SessionError;

use super::protocol;
use super::state::ABNORMAL_CLOSE;
use super::transport::{EventSender, SessionHandle, SessionSetup, Transport, TransportEvent};

/// Default bidirectional streaming endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Bound on the TCP/TLS/websocket handshake plus the setup send.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Websocket transport to the live audio service.
pub struct LiveTransport {
    endpoint: String,
    api_key: Option<String>,
    connect_timeout: Duration,
}

impl LiveTransport {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn build_request(&self) -> Result<http::Request<()>, SessionError> {
        let key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SessionError::Policy("No API credential configured".into()))?;

        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Policy(format!("Invalid endpoint {}: {}", self.endpoint, e)))?;

        let value = http::HeaderValue::from_str(key)
            .map_err(|_| SessionError::Policy("API credential is not a valid header value".into()))?;
        request.headers_mut().insert("x-goog-api-key", value);
        Ok(request)
    }
}

/// Handshake failures that will not go away by retrying.
fn classify_connect_error(err: tungstenite::Error) -> SessionError {
    match &err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            if matches!(code, 400 | 401 | 403 | 404) {
                SessionError::Policy(format!("Handshake rejected with HTTP {}", code))
            } else {
                SessionError::Transient(format!("Handshake failed with HTTP {}", code))
            }
        }
        tungstenite::Error::Url(e) => SessionError::Policy(format!("Invalid endpoint: {}", e)),
        _ => SessionError::Transient(format!("Connection failed: {}", err)),
    }
}

impl Transport for LiveTransport {
    fn connect(
        &self,
        setup: SessionSetup,
        outbound_capacity: usize,
        events: EventSender,
    ) -> Pin<Box<dyn Future<Output = Result<SessionHandle, SessionError>> + Send + '_>> {
        Box::pin(async move {
            let request = self.build_request()?;
            let connection_id = uuid::Uuid::new_v4().as_simple().to_string();
            info!(connection_id = %connection_id, model = %setup.model, voice = %setup.voice_name, "Opening live session");

            let setup_json = protocol::setup_message(&setup)
                .map_err(|e| SessionError::Policy(format!("Invalid session setup: {}", e)))?;

            let handshake = async {
                let (ws, _response) = connect_async(request).await.map_err(classify_connect_error)?;
                let (mut ws_tx, ws_rx) = ws.split();
                ws_tx
                    .send(Message::Text(setup_json))
                    .await
                    .map_err(|e| SessionError::Transient(format!("Failed to send setup: {}", e)))?;
                Ok::<_, SessionError>((ws_tx, ws_rx))
            };
            let (ws_tx, ws_rx) = tokio::time::timeout(self.connect_timeout, handshake)
                .await
                .map_err(|_| {
                    warn!(connection_id = %connection_id, "Handshake timed out");
                    SessionError::Transient(format!(
                        "Handshake timed out after {} ms",
                        self.connect_timeout.as_millis()
                    ))
                })??;

            let (out_tx, out_rx) = mpsc::channel(outbound_capacity.max(1));
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

            tokio::spawn(run_writer(ws_tx, out_rx, shutdown_rx, connection_id.clone()));
            let reader = tokio::spawn(run_reader(ws_rx, events, connection_id));

            Ok(SessionHandle::new(out_tx, move || {
                let _ = shutdown_tx.send(());
                reader.abort();
            }))
        })
    }
}

/// Drain the outbound queue into the socket until shutdown.
async fn run_writer(
    mut ws_tx: WsSink,
    mut frames: mpsc::Receiver<OutboundFrame>,
    mut shutdown: oneshot::Receiver<()>,
    connection_id: String,
) {
    let mut sent: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let text = match protocol::realtime_input(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize audio frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    // The reader sees the broken socket and reports the close.
                    warn!(connection_id = %connection_id, "Failed to send audio frame: {}", e);
                    break;
                }
                sent += 1;
            }
        }
    }
    let _ = ws_tx.close().await;
    debug!(connection_id = %connection_id, sent, "Live session writer exiting");
}

/// Forward inbound messages as transport events until the socket closes.
async fn run_reader(mut ws_rx: WsSource, events: EventSender, connection_id: String) {
    let mut opened = false;
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_payload(&text, &events, &mut opened),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_payload(text, &events, &mut opened),
                Err(_) => warn!(len = bytes.len(), "Ignoring non-UTF-8 binary message"),
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                    .unwrap_or((None, String::new()));
                info!(connection_id = %connection_id, ?code, reason = %reason, "Live session closed by service");
                let _ = events.send(TransportEvent::Closed { code, reason });
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %connection_id, "Live session read error: {}", e);
                let _ = events.send(read_error_event(e));
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed {
        code: Some(ABNORMAL_CLOSE),
        reason: "connection dropped".into(),
    });
}

/// A dropped socket reads as an abnormal close; anything else the peer got
/// wrong on the wire is a failure of the session itself.
fn read_error_event(err: tungstenite::Error) -> TransportEvent {
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Io(_) => TransportEvent::Closed {
            code: Some(ABNORMAL_CLOSE),
            reason: err.to_string(),
        },
        other => TransportEvent::Failed(SessionError::Transient(format!(
            "Protocol error: {}",
            other
        ))),
    }
}

/// Turn one JSON payload into zero or more transport events.
fn handle_payload(text: &str, events: &EventSender, opened: &mut bool) {
    let msg = match protocol::parse_server_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Unparseable server message: {}", e);
            return;
        }
    };

    if msg.is_setup_complete() && !*opened {
        *opened = true;
        let _ = events.send(TransportEvent::Opened);
    }
    if let Some(go_away) = &msg.go_away {
        warn!(time_left = ?go_away.time_left, "Service will end the session soon");
    }
    if let Some(event) = msg.server_event() {
        let _ = events.send(TransportEvent::Message(event));
    }
}
