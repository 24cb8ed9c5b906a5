//! WebSocket Transport
//!
//! [`FeedTransport`] adapter over `tokio-tungstenite`.
//!
//! The bearer token travels as a `token` query parameter. Each open link is
//! served by one pump task that forwards queued outbound frames and relays
//! inbound frames until either side closes. Protocol pings are answered
//! inside the pump.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::application::ports::{
    FeedTransport, OutboundFrame, TransportError, TransportEvent, TransportLink,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 1024;

/// WebSocket feed transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Create a transport for `url`.
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint with the token appended as a query parameter.
    #[must_use]
    pub fn endpoint(&self, token: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn open(&self, token: &str) -> Result<TransportLink, TransportError> {
        let endpoint = self.endpoint(token);
        tracing::info!(url = %self.url, "Connecting to feed");

        let handshake = tokio_tungstenite::connect_async(endpoint.as_str());
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectionFailed("handshake timed out".to_string()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(pump(socket, outbound_rx, inbound_tx));

        Ok(TransportLink { outbound, inbound })
    }
}

async fn pump(
    socket: Socket,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<TransportEvent>,
) {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        tracing::debug!("Feed socket closed locally");
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(TransportEvent::Message(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if inbound.send(TransportEvent::Message(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::debug!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                        tracing::info!(reason = ?reason, "Server sent close frame");
                        let _ = inbound.send(TransportEvent::Closed { reason }).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = inbound.send(TransportEvent::Closed { reason: None }).await;
                        break;
                    }
                }
            }
        }
    }
}
