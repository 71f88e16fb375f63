use crate::core::connection_state::ReadyState;
use crate::traits::error::{Result, RobustSocketError};
use crate::traits::message::{CloseEvent, WsMessage};
use async_trait::async_trait;
use tracing::warn;

/// An event surfaced by a physical connection.
///
/// Events are pulled through [`PhysicalConnection::recv`] and queue inside
/// the connection until read, so nothing arriving between construction and
/// adoption can be lost.
#[derive(Debug, Clone)]
pub enum PhysicalEvent {
    /// The connection finished its opening handshake
    Open,
    /// A data frame arrived
    Message(WsMessage),
    /// A transport-level error; a close event follows
    Error(String),
    /// The connection is gone; this is the last event
    Close(CloseEvent),
}

/// A single underlying WebSocket.
///
/// Its lifetime is a subset of the logical connection's: the logical layer
/// adopts one physical connection at a time and replaces it after a drop.
/// Dropping a physical connection tears down its transport, so an
/// unwanted connection (e.g. one that finished connecting after the logical
/// connection was closed) is discarded simply by dropping it.
#[async_trait]
pub trait PhysicalConnection: Send {
    /// Current state of this physical connection
    fn ready_state(&self) -> ReadyState;

    /// The URL this connection was opened against
    fn url(&self) -> String;

    /// Negotiated subprotocol, empty if none
    fn protocol(&self) -> String;

    /// Negotiated extensions, empty if none
    fn extensions(&self) -> String;

    /// Queue a frame for transmission
    fn send(&mut self, message: WsMessage) -> Result<()>;

    /// Start the close handshake.
    ///
    /// Implementations validate `code` and `reason` the way the WebSocket
    /// API does and must return an error without side effects when the
    /// arguments are unacceptable.
    fn close(&mut self, code: u16, reason: &str) -> Result<()>;

    /// Next event, or `None` once the event stream is exhausted
    async fn recv(&mut self) -> Option<PhysicalEvent>;
}

/// Constructs physical connections for the logical layer.
///
/// The factory owns whatever context the transport needs (TLS config,
/// headers, proxies); the logical layer only supplies the URL, which
/// already carries the session query parameter.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PhysicalConnection>>;
}

/// Wait until a freshly constructed physical connection reaches OPEN.
///
/// Handles every state the connection may already be in: an OPEN
/// connection resolves immediately, a CLOSING/CLOSED one fails, and a
/// CONNECTING one is driven by consuming its events until `Open` arrives.
pub async fn await_open(conn: &mut dyn PhysicalConnection) -> Result<()> {
    match conn.ready_state() {
        ReadyState::Open => return Ok(()),
        ReadyState::Closing | ReadyState::Closed => {
            return Err(RobustSocketError::ConnectionClosed(
                "physical connection was already closing".into(),
            ))
        }
        ReadyState::Connecting => {}
    }

    loop {
        match conn.recv().await {
            Some(PhysicalEvent::Open) => return Ok(()),
            Some(PhysicalEvent::Error(error)) => return Err(RobustSocketError::WebSocket(error)),
            Some(PhysicalEvent::Close(event)) => {
                return Err(RobustSocketError::ConnectionClosed(format!(
                    "closed before open with code {}",
                    event.code
                )))
            }
            Some(PhysicalEvent::Message(_)) => {
                // cannot happen on a conforming transport
                warn!("discarding message received before open");
            }
            None => {
                return Err(RobustSocketError::ConnectionClosed(
                    "event stream ended before open".into(),
                ))
            }
        }
    }
}
