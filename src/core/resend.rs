use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::buffer::MessageBuffer;
use crate::core::connection_state::{AtomicMetrics, AtomicReadyState, Metrics, ReadyState};
use crate::core::robust::{PhysicalMeta, RobustConnection, RobustEvent};
use crate::traits::error::{Result, RobustSocketError};
use crate::traits::message::{
    WsMessage, CLOSE_ACK_OUT_OF_RANGE, CLOSE_RESUME_HANDSHAKE_FAILED,
};

const ACK_PREFIX: &str = "ACK ";
const CONTINUE_PREFIX: &str = "CONTINUE ";

/// Close reasons must fit the 123-byte limit of a close frame.
const MAX_CLOSE_REASON: usize = 123;

enum ResendCommand {
    Send {
        payload: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        code: u16,
        reason: String,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// A [`RobustConnection`] decorator with resume semantics.
///
/// Every outbound payload is tagged with a monotonic id and buffered until
/// the server acknowledges it with an `ACK <HEX>` frame. After a reconnect
/// the server's first frame must be `CONTINUE <HEX>` naming the first id it
/// has not yet seen; everything the buffer still holds from that id onwards
/// is replayed, in order, before any new traffic. Control frames are
/// consumed silently - the consumer only sees data frames.
///
/// A missing or malformed `CONTINUE` closes the connection with code 3007;
/// an acknowledgement outside the buffered range closes with 3008.
pub struct BufferedResendConnection {
    robust_id: String,
    state: Arc<AtomicReadyState>,
    metrics: Arc<AtomicMetrics>,
    meta: Arc<RwLock<PhysicalMeta>>,
    commands: mpsc::UnboundedSender<ResendCommand>,
    events: mpsc::UnboundedReceiver<RobustEvent>,
}

impl BufferedResendConnection {
    /// Wrap a logical connection. The decorator takes ownership: it depends
    /// on observing every `Disconnect`/`Reconnect` of the underlying
    /// connection, so the connection cannot be shared.
    pub fn new(connection: RobustConnection) -> Self {
        let robust_id = connection.robust_id().to_string();
        let state = connection.shared_state();
        let metrics = connection.shared_metrics();
        let meta = connection.shared_meta();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = ResendDriver {
            inner: connection,
            buffer: MessageBuffer::new(),
            disconnected: false,
            awaiting_continue: false,
            commands: command_rx,
            events: event_tx,
        };
        tokio::spawn(driver.run());

        Self {
            robust_id,
            state,
            metrics,
            meta,
            commands: command_tx,
            events: event_rx,
        }
    }

    #[inline]
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    pub fn url(&self) -> String {
        self.meta.read().url.clone()
    }

    pub fn protocol(&self) -> String {
        self.meta.read().protocol.clone()
    }

    pub fn extensions(&self) -> String {
        self.meta.read().extensions.clone()
    }

    pub fn robust_id(&self) -> &str {
        &self.robust_id
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot(self.state.get())
    }

    /// Send a text payload.
    ///
    /// The payload is tagged and buffered first in every case; a failure to
    /// forward it (e.g. the connection has not opened yet) reaches the
    /// caller, but the payload stays buffered and is replayed on the next
    /// resume. While disconnected the payload is buffered without error.
    pub async fn send(&self, payload: impl Into<String>) -> Result<()> {
        let (resp, result) = oneshot::channel();
        self.commands
            .send(ResendCommand::Send {
                payload: payload.into(),
                resp,
            })
            .map_err(|e| RobustSocketError::ChannelSend(e.to_string()))?;
        result
            .await
            .map_err(|_| RobustSocketError::ChannelSend("connection driver is gone".into()))?
    }

    /// Close the logical connection
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let (resp, result) = oneshot::channel();
        if self
            .commands
            .send(ResendCommand::Close {
                code,
                reason: reason.to_string(),
                resp,
            })
            .is_err()
        {
            return Ok(());
        }
        result.await.unwrap_or(Ok(()))
    }

    /// Receive the next event (`None` once the driver has shut down)
    pub async fn recv(&mut self) -> Option<RobustEvent> {
        self.events.recv().await
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Option<RobustEvent> {
        self.events.try_recv().ok()
    }
}

enum Step {
    Inner(Option<RobustEvent>),
    Command(Option<ResendCommand>),
}

struct ResendDriver {
    inner: RobustConnection,
    buffer: MessageBuffer,
    disconnected: bool,
    awaiting_continue: bool,
    commands: mpsc::UnboundedReceiver<ResendCommand>,
    events: mpsc::UnboundedSender<RobustEvent>,
}

impl ResendDriver {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                event = self.inner.recv() => Step::Inner(event),
                command = self.commands.recv() => Step::Command(command),
            };
            match step {
                Step::Inner(Some(RobustEvent::Open)) => self.emit(RobustEvent::Open),
                Step::Inner(Some(RobustEvent::Disconnect)) => {
                    self.disconnected = true;
                    self.emit(RobustEvent::Disconnect);
                }
                Step::Inner(Some(RobustEvent::Reconnect)) => {
                    // the very next inbound frame must be the resume marker
                    self.awaiting_continue = true;
                    self.emit(RobustEvent::Reconnect);
                }
                Step::Inner(Some(RobustEvent::Message(message))) => {
                    self.handle_message(message).await;
                }
                Step::Inner(Some(RobustEvent::Error(error))) => {
                    self.emit(RobustEvent::Error(error));
                }
                Step::Inner(Some(RobustEvent::Close(event))) => {
                    self.emit(RobustEvent::Close(event));
                    return;
                }
                Step::Inner(None) => return,
                Step::Command(Some(ResendCommand::Send { payload, resp })) => {
                    let _ = resp.send(self.handle_send(payload));
                }
                Step::Command(Some(ResendCommand::Close { code, reason, resp })) => {
                    let _ = resp.send(self.inner.close(code, &reason).await);
                }
                Step::Command(None) => return,
            }
        }
    }

    fn handle_send(&mut self, payload: String) -> Result<()> {
        let wire = self.buffer.write(&payload);
        if self.disconnected {
            debug!("connection down, message buffered for resend");
            return Ok(());
        }
        match self.inner.ready_state() {
            ReadyState::Open => self.inner.send_direct(WsMessage::Text(wire)),
            state => Err(RobustSocketError::InvalidState(format!(
                "cannot send while {}",
                state
            ))),
        }
    }

    async fn handle_message(&mut self, message: WsMessage) {
        if self.awaiting_continue {
            self.awaiting_continue = false;
            if let Err(error) = self.resume(&message) {
                warn!("resume handshake failed: {}", error);
                self.protocol_close(
                    CLOSE_RESUME_HANDSHAKE_FAILED,
                    format!("RobustConnection handshake error: {}", error),
                )
                .await;
            }
            return;
        }

        if let Some(tail) = message.as_text().and_then(|text| match_control(text, ACK_PREFIX)) {
            let outcome = parse_hex_id(tail).and_then(|id| self.buffer.discard(id).map(|_| ()));
            match outcome {
                Ok(()) => debug!("acknowledged up to {}", tail),
                Err(error) => {
                    warn!("acknowledgement failed: {}", error);
                    self.protocol_close(
                        CLOSE_ACK_OUT_OF_RANGE,
                        format!("RobustConnection ack error: {}", error),
                    )
                    .await;
                }
            }
            return;
        }

        self.emit(RobustEvent::Message(message));
    }

    /// Process the first frame of a resumed session and replay everything
    /// the server has not seen.
    fn resume(&mut self, message: &WsMessage) -> Result<()> {
        let text = message
            .as_text()
            .ok_or_else(|| RobustSocketError::HandshakeFailed("expected a text frame".into()))?;
        let tail = match_control(text, CONTINUE_PREFIX).ok_or_else(|| {
            RobustSocketError::HandshakeFailed(format!("unexpected frame {:?}", text))
        })?;
        let continue_id = parse_hex_id(tail)?;

        let dropped = self.buffer.discard(continue_id)?;
        let replay = self.buffer.messages_from(continue_id)?;
        debug!(
            "resuming session: {} acknowledged, {} to resend",
            dropped,
            replay.len()
        );
        for wire in replay {
            self.inner.send_direct(WsMessage::Text(wire))?;
        }
        self.disconnected = false;
        Ok(())
    }

    async fn protocol_close(&mut self, code: u16, reason: String) {
        if let Err(error) = self.inner.close(code, &truncate_reason(reason)).await {
            warn!("failed to close after protocol error: {}", error);
        }
    }

    fn emit(&self, event: RobustEvent) {
        let _ = self.events.send(event);
    }
}

/// Match a `<PREFIX><HEX>` control frame and return the id text.
///
/// The id must be non-empty, uppercase hexadecimal, and run to the end of
/// the frame; anything else is not a control frame.
fn match_control<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let tail = text.strip_prefix(prefix)?;
    let well_formed = !tail.is_empty()
        && tail
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b));
    well_formed.then_some(tail)
}

fn parse_hex_id(tail: &str) -> Result<u64> {
    u64::from_str_radix(tail, 16).map_err(|_| {
        RobustSocketError::MalformedControlFrame(format!("id {} does not fit in 64 bits", tail))
    })
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}
