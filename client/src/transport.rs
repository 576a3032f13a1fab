//! Transport abstraction for the message channel the driver speaks over.
//! Grounded on this pack's `tokio-tungstenite`-based WebSocket wrapper: a
//! thin connect/split-halves layer rather than exposing `tungstenite`
//! types directly to the driver, so the driver can run against a live
//! WebSocket or an in-memory stub with the same code path.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// A message observed on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Everything the driver needs from a message channel: send text/binary,
/// receive the next event, and close. Implemented for a live WebSocket and
/// for an in-memory stub used by tests.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: &str) -> Result<()>;
    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()>;
    async fn recv(&mut self) -> Option<TransportEvent>;
    async fn close(&mut self);
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Live WebSocket transport.
pub struct WsTransport {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        use tungstenite::client::IntoClientRequest;
        let request = url.into_client_request().with_context(|| format!("invalid endpoint URL: {url}"))?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket connect failed")?;
        let (sink, stream) = ws_stream.split();
        Ok(Self { sink, stream })
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string().into()))
            .await
            .context("send_text failed")
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(bytes.into()))
            .await
            .context("send_binary failed")
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(t))) => return Some(TransportEvent::Text(t.to_string())),
                Some(Ok(tungstenite::Message::Binary(b))) => return Some(TransportEvent::Binary(b.to_vec())),
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code.into(), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(TransportEvent::Close { code, reason });
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_))) => {
                    continue;
                }
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// In-memory transport pair for tests: `StubTransport::pair()` returns a
/// (client-facing, test-harness-facing) pair wired together with channels,
/// so a test can push server messages in and assert on what the driver
/// sends out without a real socket.
pub struct StubTransport {
    outbound: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    inbound: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
}

/// The harness-side half of a stub transport pair.
pub struct StubHarness {
    pub sent: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    pub to_deliver: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
}

impl StubTransport {
    pub fn pair() -> (Self, StubHarness) {
        let (sent_tx, sent_rx) = tokio::sync::mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            StubTransport { outbound: sent_tx, inbound: deliver_rx },
            StubHarness { sent: sent_rx, to_deliver: deliver_tx },
        )
    }
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.outbound
            .send(TransportEvent::Text(text.to_string()))
            .map_err(|_| anyhow::anyhow!("harness dropped"))
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.outbound
            .send(TransportEvent::Binary(bytes))
            .map_err(|_| anyhow::anyhow!("harness dropped"))
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_invalid_url_returns_error() {
        let result = WsTransport::connect("not-a-url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_unreachable_host_returns_error() {
        let result = WsTransport::connect("ws://127.0.0.1:1/invalid").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stub_pair_roundtrips_client_sends_and_server_deliveries() {
        let (mut client, mut harness) = StubTransport::pair();
        client.send_text("hello").await.unwrap();
        assert_eq!(harness.sent.recv().await, Some(TransportEvent::Text("hello".to_string())));

        harness.to_deliver.send(TransportEvent::Binary(vec![1, 2, 3])).unwrap();
        assert_eq!(client.recv().await, Some(TransportEvent::Binary(vec![1, 2, 3])));
    }
}
