//! WebSocket transport.
//!
//! Used for remote daemons (`ws://` / `wss://` endpoints) and for the
//! local daemon when it listens on a loopback TCP port. WebSocket frames
//! already delimit messages, so no line reassembly is needed; a trailing
//! newline from the peer is tolerated and stripped.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{LinkGuard, Transport, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over a persistent WebSocket connection.
pub struct WebSocketTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<Option<Link>>,
}

struct Link {
    out_tx: mpsc::UnboundedSender<String>,
    guard: Arc<LinkGuard>,
    reader: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            url: url.into(),
            events,
            link: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if !existing.guard.is_closed() {
                return Ok(());
            }
        }

        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "websocket transport connected");

        let (sink, stream) = ws_stream.split();
        let guard = LinkGuard::new(self.events.clone());
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(stream, guard.clone()));
        tokio::spawn(write_loop(sink, out_rx, guard.clone()));

        *link = Some(Link {
            out_tx,
            guard,
            reader,
        });
        Ok(())
    }

    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) if !link.guard.is_closed() => link
                .out_tx
                .send(line.to_string())
                .map_err(|_| TransportError::NotConnected),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.guard.close("closed");
            link.reader.abort();
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, guard: Arc<LinkGuard>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let frame = text.trim();
                if !frame.is_empty() {
                    guard.message(frame.to_string());
                }
            }
            Ok(Message::Binary(data)) => {
                // Some daemons send JSON frames as binary; accept them when
                // they are valid UTF-8 and drop them otherwise.
                match String::from_utf8(data) {
                    Ok(text) => {
                        let frame = text.trim();
                        if !frame.is_empty() {
                            guard.message(frame.to_string());
                        }
                    }
                    Err(_) => debug!("dropping non-utf8 binary websocket frame"),
                }
            }
            Ok(Message::Close(_)) => {
                guard.close("connection closed by peer");
                return;
            }
            Ok(_) => {} // ping/pong handled by tungstenite
            Err(e) => {
                guard.close(format!("read failed: {}", e));
                return;
            }
        }
    }
    guard.close("connection closed by peer");
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    guard: Arc<LinkGuard>,
) {
    while let Some(line) = out_rx.recv().await {
        if let Err(e) = sink.send(Message::Text(line)).await {
            guard.close(format!("write failed: {}", e));
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    async fn recv_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_round_trip_against_scripted_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        // Peer: accept one websocket, echo the handshake exchange, hang up.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("ws accept");
            let frame = ws.next().await.expect("frame").expect("frame ok");
            assert_eq!(
                frame.into_text().expect("text"),
                "{\"type\":\"hello\",\"version\":1}"
            );
            ws.send(Message::Text(
                "{\"type\":\"welcome\",\"capabilities\":[\"sessions\"]}".to_string(),
            ))
            .await
            .expect("send");
            ws.close(None).await.expect("close");
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new(format!("ws://{}", addr), events_tx);
        transport.connect().await.expect("connect");
        transport.connect().await.expect("second connect no-op");

        transport
            .send("{\"type\":\"hello\",\"version\":1}")
            .await
            .expect("send");

        match recv_event(&mut events_rx).await {
            TransportEvent::Message(m) => {
                assert_eq!(m, "{\"type\":\"welcome\",\"capabilities\":[\"sessions\"]}");
            }
            other => panic!("expected message, got {:?}", other),
        }
        match recv_event(&mut events_rx).await {
            TransportEvent::Closed(_) => {}
            other => panic!("expected closed, got {:?}", other),
        }

        server.await.expect("server task");
        transport.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        // Port 1 is never listening
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", events_tx);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connect(_))
        ));
    }
}
