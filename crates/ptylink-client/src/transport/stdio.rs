//! Subprocess stdio transport.
//!
//! Spawns a helper process (typically `ssh <host> <daemon> --stdio`) and
//! frames the protocol over its stdin/stdout. The transport owns the
//! child: EOF on its stdout or process exit raises `Closed`, and tearing
//! the transport down kills the child.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::framing::read_line_bounded;
use super::{LinkGuard, Transport, TransportError, TransportEvent, MAX_FRAME_SIZE};

/// Transport over a spawned subprocess's standard streams.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<Option<Link>>,
}

struct Link {
    out_tx: mpsc::UnboundedSender<String>,
    guard: Arc<LinkGuard>,
    reader: JoinHandle<()>,
    /// Owns the child; aborting it drops (and thereby kills) the process.
    waiter: JoinHandle<()>,
}

impl StdioTransport {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            events,
            link: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if !existing.guard.is_closed() {
                return Ok(());
            }
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        debug!(command = %self.command, "stdio transport spawned process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("child stdout unavailable".to_string()))?;

        let guard = LinkGuard::new(self.events.clone());
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(stdout, guard.clone()));
        tokio::spawn(write_loop(stdin, out_rx, guard.clone()));
        let waiter = tokio::spawn(wait_loop(child, guard.clone()));

        *link = Some(Link {
            out_tx,
            guard,
            reader,
            waiter,
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
            link.waiter.abort();
        }
    }
}

async fn read_loop(stdout: ChildStdout, guard: Arc<LinkGuard>) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match read_line_bounded(&mut reader, &mut line, MAX_FRAME_SIZE).await {
            Ok(0) => {
                guard.close("process closed its output");
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
    mut stdin: ChildStdin,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    guard: Arc<LinkGuard>,
) {
    while let Some(line) = out_rx.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            guard.close(format!("write failed: {}", e));
            break;
        }
    }
}

async fn wait_loop(mut child: Child, guard: Arc<LinkGuard>) {
    match child.wait().await {
        Ok(status) => guard.close(format!("process exited: {}", status)),
        Err(e) => guard.close(format!("process wait failed: {}", e)),
    }
}
