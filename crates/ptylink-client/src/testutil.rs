//! Shared test helpers: an in-memory transport, timing utilities, and an
//! environment-variable guard.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ptylink_core::protocol::{self, DaemonMessage};

use crate::connection::{Connection, ConnectionConfig, ConnectionState};
use crate::transport::{Transport, TransportError, TransportEvent};

/// In-memory transport: records outbound frames, lets the test inject
/// inbound events.
pub(crate) struct FakeTransport {
    sent: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_calls: AtomicUsize,
    fail_connect: AtomicBool,
    connected: AtomicBool,
}

impl FakeTransport {
    pub(crate) fn create() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                events: events_tx,
                connect_calls: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
            events_rx,
        )
    }

    pub(crate) fn frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn inject(&self, msg: &DaemonMessage) {
        let line = protocol::encode_line(msg).unwrap();
        self.events.send(TransportEvent::Message(line)).unwrap();
    }

    pub(crate) fn inject_raw(&self, line: &str) {
        self.events
            .send(TransportEvent::Message(line.to_string()))
            .unwrap();
    }

    pub(crate) fn inject_close(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.events
            .send(TransportEvent::Closed(reason.to_string()))
            .unwrap();
    }

    /// Wait until `count` frames have been sent, then return them.
    pub(crate) async fn wait_frames(&self, count: usize) -> Vec<String> {
        timeout(Duration::from_secs(2), async {
            loop {
                let frames = self.frames();
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {} frames, got {:?}",
                count,
                self.frames()
            )
        })
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, line: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Tight timings so state-machine tests finish quickly.
pub(crate) fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        hello_interval: Duration::from_millis(30),
        handshake_deadline: Duration::from_millis(500),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        socket_poll_interval: Duration::from_millis(10),
        snapshot_timeout: Duration::from_millis(40),
        replay_window: Duration::from_millis(80),
        cursor_style: None,
    }
}

pub(crate) fn welcome(caps: &[&str]) -> DaemonMessage {
    DaemonMessage::Welcome {
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        session_id: None,
    }
}

pub(crate) async fn wait_for_state(
    conn: &Connection,
    want: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut rx = conn.watch_state();
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let state = rx.borrow_and_update().clone();
                if want(&state) {
                    return state;
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for state")
}

// Env var manipulation is process-global, so tests touching it must run
// serially.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Saves and restores environment variables, holding the serialization
/// lock for the guard's lifetime.
pub(crate) struct EnvGuard {
    vars: Vec<(String, Option<String>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    pub(crate) fn new(var_names: &[&str]) -> Self {
        let lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let vars = var_names
            .iter()
            .map(|name| (name.to_string(), std::env::var(name).ok()))
            .collect();
        Self { vars, _lock: lock }
    }

    pub(crate) fn set(&self, name: &str, value: &str) {
        // SAFETY: ENV_MUTEX is held, so no other test thread touches the
        // environment concurrently.
        unsafe { std::env::set_var(name, value) };
    }

    pub(crate) fn remove(&self, name: &str) {
        // SAFETY: ENV_MUTEX is held.
        unsafe { std::env::remove_var(name) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.vars {
            // SAFETY: ENV_MUTEX is held until the guard is fully dropped.
            unsafe {
                match value {
                    Some(v) => std::env::set_var(name, v),
                    None => std::env::remove_var(name),
                }
            }
        }
    }
}
