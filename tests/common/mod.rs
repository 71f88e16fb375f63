//! Common test utilities for robustsockets integration tests
//!
//! Provides a scripted connection factory for driving the logical
//! connection deterministically, and a small mock WebSocket server for
//! exercising the real transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use robustsockets::{
    AtomicReadyState, BufferedResendConnection, CloseEvent, ConnectionFactory, FixedDelay,
    PhysicalConnection, PhysicalEvent, ReadyState, Result, RobustConnection,
    RobustConnectionBuilder, RobustEvent, RobustSocketError, WsMessage,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

/// What the factory should do on its next `connect` call
pub enum Outcome {
    /// Produce a physical connection that opens on its own
    Accept,
    /// Produce a physical connection and leave opening to the test
    AcceptManual,
    /// Fail the attempt
    Reject(String),
}

/// A scripted [`ConnectionFactory`].
///
/// Each `connect` call consumes the next scripted outcome (rejecting when
/// the script runs dry) and pushes a [`PhysicalControl`] for every accepted
/// connection so the test can play the server side.
pub struct MockFactory {
    outcomes: Mutex<VecDeque<Outcome>>,
    controls: mpsc::UnboundedSender<PhysicalControl>,
    urls: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PhysicalControl>) {
        let (controls, control_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            controls,
            urls: Mutex::new(Vec::new()),
        });
        (factory, control_rx)
    }

    pub fn expect(&self, outcome: Outcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Every URL `connect` was called with, in order
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.urls.lock().unwrap().len()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, url: &str) -> Result<Box<dyn PhysicalConnection>> {
        self.urls.lock().unwrap().push(url.to_string());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Outcome::Reject("no scripted connection".into()));
        match outcome {
            Outcome::Reject(reason) => Err(RobustSocketError::WebSocket(reason)),
            Outcome::Accept => {
                let (physical, control) = MockPhysical::pair(url);
                control.open();
                let _ = self.controls.send(control);
                Ok(Box::new(physical))
            }
            Outcome::AcceptManual => {
                let (physical, control) = MockPhysical::pair(url);
                let _ = self.controls.send(control);
                Ok(Box::new(physical))
            }
        }
    }
}

/// A scripted physical connection
pub struct MockPhysical {
    url: String,
    state: Arc<AtomicReadyState>,
    events: mpsc::UnboundedReceiver<PhysicalEvent>,
    event_tx: mpsc::UnboundedSender<PhysicalEvent>,
    sent: Arc<Mutex<Vec<WsMessage>>>,
    close_error: Arc<Mutex<Option<String>>>,
    closed_with: Arc<Mutex<Option<(u16, String)>>>,
}

impl MockPhysical {
    fn pair(url: &str) -> (Self, PhysicalControl) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicReadyState::new(ReadyState::Connecting));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let close_error = Arc::new(Mutex::new(None));
        let closed_with = Arc::new(Mutex::new(None));
        let control = PhysicalControl {
            event_tx: event_tx.clone(),
            state: Arc::clone(&state),
            sent: Arc::clone(&sent),
            close_error: Arc::clone(&close_error),
            closed_with: Arc::clone(&closed_with),
        };
        let physical = Self {
            url: url.to_string(),
            state,
            events,
            event_tx,
            sent,
            close_error,
            closed_with,
        };
        (physical, control)
    }
}

#[async_trait]
impl PhysicalConnection for MockPhysical {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn protocol(&self) -> String {
        "mock".into()
    }

    fn extensions(&self) -> String {
        String::new()
    }

    fn send(&mut self, message: WsMessage) -> Result<()> {
        if self.state.get() != ReadyState::Open {
            return Err(RobustSocketError::InvalidState(format!(
                "cannot send while {}",
                self.state.get()
            )));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        if let Some(detail) = self.close_error.lock().unwrap().clone() {
            return Err(RobustSocketError::InvalidCloseArgs(detail));
        }
        *self.closed_with.lock().unwrap() = Some((code, reason.to_string()));
        if !self.state.get().is_past_open() {
            self.state.advance(ReadyState::Closing);
        }
        // the scripted server completes the handshake immediately
        let _ = self
            .event_tx
            .send(PhysicalEvent::Close(CloseEvent::new(code, reason, true)));
        Ok(())
    }

    async fn recv(&mut self) -> Option<PhysicalEvent> {
        self.events.recv().await
    }
}

/// The server side of a [`MockPhysical`]
#[derive(Clone)]
pub struct PhysicalControl {
    event_tx: mpsc::UnboundedSender<PhysicalEvent>,
    state: Arc<AtomicReadyState>,
    sent: Arc<Mutex<Vec<WsMessage>>>,
    close_error: Arc<Mutex<Option<String>>>,
    closed_with: Arc<Mutex<Option<(u16, String)>>>,
}

impl PhysicalControl {
    /// Complete the opening handshake
    pub fn open(&self) {
        self.state.advance(ReadyState::Open);
        let _ = self.event_tx.send(PhysicalEvent::Open);
    }

    /// Deliver a text frame from the server
    pub fn server_send(&self, text: &str) {
        let _ = self
            .event_tx
            .send(PhysicalEvent::Message(WsMessage::Text(text.to_string())));
    }

    /// Deliver a binary frame from the server
    pub fn server_send_binary(&self, data: &[u8]) {
        let _ = self
            .event_tx
            .send(PhysicalEvent::Message(WsMessage::Binary(data.to_vec())));
    }

    /// Tear the connection down without a close handshake
    pub fn drop_connection(&self, code: u16) {
        self.state.advance(ReadyState::Closed);
        let _ = self
            .event_tx
            .send(PhysicalEvent::Close(CloseEvent::new(code, "", false)));
    }

    /// Close cleanly from the server side
    pub fn server_close(&self, code: u16, reason: &str) {
        self.state.advance(ReadyState::Closed);
        let _ = self
            .event_tx
            .send(PhysicalEvent::Close(CloseEvent::new(code, reason, true)));
    }

    /// Surface a transport error
    pub fn error(&self, detail: &str) {
        let _ = self.event_tx.send(PhysicalEvent::Error(detail.to_string()));
    }

    /// Make the next `close` call fail, as the WebSocket API does for
    /// unacceptable arguments
    pub fn reject_close(&self, detail: &str) {
        *self.close_error.lock().unwrap() = Some(detail.to_string());
    }

    /// Text frames the client put on this connection's wire, in order
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|message| message.as_text().map(String::from))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// The (code, reason) the client closed this connection with
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed_with.lock().unwrap().clone()
    }

    /// True once the physical connection object has been dropped
    pub fn is_discarded(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Builder preconfigured for fast, deterministic tests
pub fn test_builder(factory: Arc<MockFactory>) -> RobustConnectionBuilder {
    RobustConnection::builder("ws://test.invalid/socket", factory)
        .reconnect_timeout(Duration::from_secs(5))
        .reconnect_policy(FixedDelay::new(Duration::from_millis(20)))
}

/// Next event of a robust connection, bounded so a broken driver fails the
/// test instead of hanging it
pub async fn next_robust_event(conn: &mut RobustConnection) -> RobustEvent {
    tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended unexpectedly")
}

/// Next event of a buffered-resend connection
pub async fn next_resend_event(conn: &mut BufferedResendConnection) -> RobustEvent {
    tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended unexpectedly")
}

/// Poll `predicate` until it holds, failing after one second
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within one second");
}

/// A simple mock WebSocket server echoing every data frame
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl MockWsServer {
    /// Create and start a new mock WebSocket server
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let shutdown = shutdown_clone.clone();
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, shutdown).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self { addr, shutdown }
    }

    async fn handle_connection(stream: tokio::net::TcpStream, shutdown: Arc<Notify>) {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::accept_async;

        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            if msg.is_text() || msg.is_binary() {
                                // Echo the message back
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            } else if msg.is_close() {
                                // complete the close handshake with the
                                // peer's own code
                                let _ = write.send(msg).await;
                                break;
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
