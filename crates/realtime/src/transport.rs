//! Reconnecting WebSocket transport behind [`SocketChannel`](crate::SocketChannel).

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::ChannelInner;
use crate::error::{Result, SocketError};
use crate::frame::{decode, encode_connect, encode_event, encode_pong, Frame, FrameProtocol};
use stockyard_core::sync::{
    reconnect_delay, SocketEnvelope, SOCKET_RECONNECT_INITIAL_DELAY_MS,
    SOCKET_RECONNECT_MAX_ATTEMPTS, SOCKET_RECONNECT_MAX_DELAY_MS,
};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect behaviour after a failed connect or a dropped connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before the transport stops.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay added as random jitter. `0.0` disables it.
    pub randomization_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: SOCKET_RECONNECT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(SOCKET_RECONNECT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(SOCKET_RECONNECT_MAX_DELAY_MS),
            randomization_factor: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = reconnect_delay(attempt, self.initial_delay, self.max_delay);
        if self.randomization_factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.randomization_factor.min(1.0);
        let jitter = rand::thread_rng().gen_range(0.0..=spread);
        delay + Duration::from_secs_f64(jitter)
    }
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Full WebSocket URL, e.g. `wss://host/socket.io/?EIO=4&transport=websocket`.
    pub url: String,
    pub access_token: Option<String>,
    pub protocol: FrameProtocol,
    pub reconnect: ReconnectPolicy,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: None,
            protocol: FrameProtocol::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_protocol(mut self, protocol: FrameProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// The server sent a namespace disconnect; do not reconnect.
    ServerDisconnect,
    Lost {
        was_connected: bool,
        reason: String,
    },
}

/// Connect, run sessions, and reconnect until the server disconnects us or
/// the attempt budget is exhausted.
pub(crate) async fn run_transport(inner: Arc<ChannelInner>, config: SocketConfig) {
    let mut outbound = inner.outbound_rx.lock().await;
    let mut failures: u32 = 0;

    loop {
        let end = match open(&config).await {
            Ok(stream) => run_session(&inner, &config, stream, &mut outbound).await,
            Err(err) => SessionEnd::Lost {
                was_connected: false,
                reason: err.to_string(),
            },
        };
        inner.set_connected(false);

        match end {
            SessionEnd::ServerDisconnect => {
                info!("[Socket] Server closed the session");
                return;
            }
            SessionEnd::Lost {
                was_connected,
                reason,
            } => {
                if was_connected {
                    failures = 0;
                }
                failures += 1;
                if failures > config.reconnect.max_attempts {
                    warn!(
                        "[Socket] Giving up after {} reconnect attempts: {}",
                        config.reconnect.max_attempts, reason
                    );
                    return;
                }
                let delay = config.reconnect.delay(failures);
                warn!(
                    "[Socket] Connection lost ({}); retry {}/{} in {:?}",
                    reason, failures, config.reconnect.max_attempts, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn open(config: &SocketConfig) -> Result<Stream> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| SocketError::connect(format!("{}: {}", config.url, e)))?;
    if let Some(token) = config.access_token.as_deref() {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SocketError::connect(format!("invalid access token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| SocketError::connect(format!("{}: {}", config.url, e)))?;
    debug!("[Socket] WebSocket open: {}", config.url);
    Ok(stream)
}

async fn run_session(
    inner: &ChannelInner,
    config: &SocketConfig,
    stream: Stream,
    outbound: &mut mpsc::UnboundedReceiver<SocketEnvelope>,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();
    let mut was_connected = false;
    let lost = |was_connected: bool, reason: String| SessionEnd::Lost {
        was_connected,
        reason,
    };

    if config.protocol == FrameProtocol::Json {
        // Plain JSON servers have no namespace handshake.
        inner.set_connected(true);
        was_connected = true;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        return lost(was_connected, format!("close frame {:?}", frame));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return lost(was_connected, SocketError::from(e).to_string()),
                    None => return lost(was_connected, "stream ended".to_string()),
                };

                let frame = match decode(text.as_str(), config.protocol) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("[Socket] Dropping frame: {}", e);
                        continue;
                    }
                };

                let reply = match frame {
                    Frame::Open => Some(encode_connect(config.access_token.as_deref())),
                    Frame::Connected => {
                        inner.set_connected(true);
                        was_connected = true;
                        None
                    }
                    Frame::ConnectError(message) => {
                        return lost(was_connected, SocketError::Rejected(message).to_string());
                    }
                    Frame::Ping => Some(encode_pong().to_string()),
                    Frame::Event(envelope) => {
                        inner.dispatch(&envelope);
                        None
                    }
                    Frame::Disconnect => return SessionEnd::ServerDisconnect,
                    Frame::Close => return lost(was_connected, "engine close".to_string()),
                    Frame::Pong | Frame::Ignored => None,
                };

                if let Some(reply) = reply {
                    if let Err(e) = write.send(Message::text(reply)).await {
                        return lost(was_connected, SocketError::from(e).to_string());
                    }
                }
            }
            Some(envelope) = outbound.recv(), if inner.is_connected() => {
                debug!("[Socket] Emitting '{}'", envelope.event_name);
                let text = encode_event(&envelope, config.protocol);
                if let Err(e) = write.send(Message::text(text)).await {
                    return lost(was_connected, SocketError::from(e).to_string());
                }
            }
        }
    }
}
