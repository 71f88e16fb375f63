//! Production WebSocket transport backed by tokio-tungstenite.
//!
//! [`TungsteniteFactory`] performs the HTTP upgrade with `connect_async`
//! and hands the stream to a pump task that translates frames into
//! [`PhysicalEvent`]s. The pump owns the socket; the connection object is
//! just a handle, and dropping it aborts the pump and with it the socket.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::core::connection_state::{AtomicReadyState, ReadyState};
use crate::traits::error::{Result, RobustSocketError};
use crate::traits::factory::{ConnectionFactory, PhysicalConnection, PhysicalEvent};
use crate::traits::message::{CloseEvent, WsMessage, CLOSE_NO_STATUS};

/// Connection factory for plain `ws://` (and, with TLS support compiled
/// into tokio-tungstenite, `wss://`) endpoints
pub struct TungsteniteFactory;

#[async_trait]
impl ConnectionFactory for TungsteniteFactory {
    async fn connect(&self, url: &str) -> Result<Box<dyn PhysicalConnection>> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| RobustSocketError::WebSocket(e.to_string()))?;
        debug!("websocket handshake completed for {}", url);
        Ok(Box::new(TungsteniteConnection::spawn(
            url.to_string(),
            header(&response, "sec-websocket-protocol"),
            header(&response, "sec-websocket-extensions"),
            stream,
        )))
    }
}

fn header(response: &Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

enum Outgoing {
    Frame(Message),
    Close { code: u16, reason: String },
}

/// One live tungstenite WebSocket behind the [`PhysicalConnection`] seam
pub struct TungsteniteConnection {
    url: String,
    protocol: String,
    extensions: String,
    state: Arc<AtomicReadyState>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    events: mpsc::UnboundedReceiver<PhysicalEvent>,
    pump: tokio::task::JoinHandle<()>,
}

impl TungsteniteConnection {
    fn spawn(
        url: String,
        protocol: String,
        extensions: String,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Self {
        // connect_async returns after the upgrade, so the connection is
        // born OPEN
        let state = Arc::new(AtomicReadyState::new(ReadyState::Open));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(stream, outgoing_rx, event_tx, Arc::clone(&state)));
        Self {
            url,
            protocol,
            extensions,
            state,
            outgoing: outgoing_tx,
            events: event_rx,
            pump,
        }
    }
}

#[async_trait]
impl PhysicalConnection for TungsteniteConnection {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn protocol(&self) -> String {
        self.protocol.clone()
    }

    fn extensions(&self) -> String {
        self.extensions.clone()
    }

    fn send(&mut self, message: WsMessage) -> Result<()> {
        if self.state.get() != ReadyState::Open {
            return Err(RobustSocketError::InvalidState(format!(
                "cannot send while {}",
                self.state.get()
            )));
        }
        let frame = match message {
            WsMessage::Text(text) => Message::Text(text),
            WsMessage::Binary(data) => Message::Binary(data),
        };
        self.outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|e| RobustSocketError::ChannelSend(e.to_string()))
    }

    fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        // same argument rules as the WebSocket API
        if code != 1000 && !(3000..=4999).contains(&code) {
            return Err(RobustSocketError::InvalidCloseArgs(format!(
                "close code {} is not allowed",
                code
            )));
        }
        if reason.len() > 123 {
            return Err(RobustSocketError::InvalidCloseArgs(
                "close reason longer than 123 bytes".into(),
            ));
        }
        if self.state.get().is_past_open() {
            return Ok(());
        }
        self.state.advance(ReadyState::Closing);
        self.outgoing
            .send(Outgoing::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|e| RobustSocketError::ChannelSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<PhysicalEvent> {
        self.events.recv().await
    }
}

impl Drop for TungsteniteConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<PhysicalEvent>,
    state: Arc<AtomicReadyState>,
) {
    let (mut write, mut read) = stream.split();

    let close_event = loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(PhysicalEvent::Message(WsMessage::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(PhysicalEvent::Message(WsMessage::Binary(data)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| CloseEvent::new(u16::from(f.code), f.reason.into_owned(), true))
                        .unwrap_or_else(|| CloseEvent::new(CLOSE_NO_STATUS, "", true));
                }
                Some(Err(error)) => {
                    let _ = events.send(PhysicalEvent::Error(error.to_string()));
                    break CloseEvent::abnormal();
                }
                None => break CloseEvent::abnormal(),
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(error) = write.send(frame).await {
                        let _ = events.send(PhysicalEvent::Error(error.to_string()));
                        break CloseEvent::abnormal();
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if write.send(Message::Close(Some(frame))).await.is_err() {
                        break CloseEvent::abnormal();
                    }
                    // keep reading until the server completes the handshake
                }
                None => {
                    // the connection handle is gone
                    let _ = write.send(Message::Close(None)).await;
                    break CloseEvent::abnormal();
                }
            }
        }
    };

    state.advance(ReadyState::Closed);
    let _ = events.send(PhysicalEvent::Close(close_event));
}
