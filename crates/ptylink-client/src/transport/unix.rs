//! Unix-domain-socket transport.
//!
//! The local daemon listens on a socket file; this transport connects to
//! it and reassembles newline-delimited frames from the stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::framing::read_line_bounded;
use super::{LinkGuard, Transport, TransportError, TransportEvent, MAX_FRAME_SIZE};

/// Transport over a unix domain socket.
pub struct UnixTransport {
    path: PathBuf,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<Option<Link>>,
}

struct Link {
    out_tx: mpsc::UnboundedSender<String>,
    guard: Arc<LinkGuard>,
    reader: JoinHandle<()>,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            path: path.into(),
            events,
            link: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if !existing.guard.is_closed() {
                return Ok(());
            }
        }

        let stream = UnixStream::connect(&self.path).await?;
        debug!(path = %self.path.display(), "unix transport connected");

        let (read_half, write_half) = stream.into_split();
        let guard = LinkGuard::new(self.events.clone());
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read_half, guard.clone()));
        tokio::spawn(write_loop(write_half, out_rx, guard.clone()));

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
            // Dropping out_tx lets the writer task drain and exit.
        }
    }

    fn local_socket_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

async fn read_loop(read_half: OwnedReadHalf, guard: Arc<LinkGuard>) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match read_line_bounded(&mut reader, &mut line, MAX_FRAME_SIZE).await {
            Ok(0) => {
                guard.close("connection closed by peer");
                break;
            }
            Ok(_) => {
                let frame = line.trim();
                if !frame.is_empty() {
                    guard.message(frame.to_string());
                }
            }
            Err(e) => {
                guard.close(format!("read failed: {}", e));
                break;
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    guard: Arc<LinkGuard>,
) {
    while let Some(line) = out_rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &line).await {
            guard.close(format!("write failed: {}", e));
            break;
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write_half.write_all(line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await
}
