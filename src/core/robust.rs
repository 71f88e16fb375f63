use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::connection_state::{AtomicMetrics, AtomicReadyState, Metrics, ReadyState};
use crate::traits::error::{Result, RobustSocketError};
use crate::traits::factory::{await_open, ConnectionFactory, PhysicalConnection, PhysicalEvent};
use crate::traits::message::{CloseEvent, WsMessage, CLOSE_FORCE_RECONNECT};
use crate::traits::reconnect::{retry_until, ExponentialBackoff, ReconnectPolicy};

/// Length of the session id shared by every physical connection of one
/// logical connection
pub const ROBUST_ID_LEN: usize = 18;

/// Query parameter announcing a new session on the first connect
const NEW_SESSION_PARAM: &str = "n";
/// Query parameter announcing a resumed session on every reconnect
const RESUME_SESSION_PARAM: &str = "o";

const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Event emitted by a logical connection.
///
/// The standard WebSocket events plus two extensions: `Disconnect` when the
/// physical connection dropped but recovery is underway, and `Reconnect`
/// when a replacement was adopted.
#[derive(Debug, Clone)]
pub enum RobustEvent {
    /// The first physical connection opened
    Open,
    /// An inbound data frame
    Message(WsMessage),
    /// A transport error surfaced
    Error(String),
    /// The physical connection dropped; reconnection started
    Disconnect,
    /// A replacement physical connection was adopted
    Reconnect,
    /// The logical connection is finished; this is the last event
    Close(CloseEvent),
}

pub(crate) fn generate_robust_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROBUST_ID_LEN)
        .map(char::from)
        .collect()
}

fn append_query_param(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, separator, key, value)
}

/// Snapshot of the adopted physical connection's identity, readable from
/// handles while the driver owns the connection itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct PhysicalMeta {
    pub(crate) url: String,
    pub(crate) protocol: String,
    pub(crate) extensions: String,
}

pub(crate) enum Command {
    /// Consumer send: forwarded when a physical is bound, queued otherwise
    Send { message: WsMessage },
    /// Decorator send: forwarded when a physical is bound, dropped otherwise
    /// (the decorator keeps its own copy and replays it after the resume
    /// handshake, so queueing here would put the frame on the wire twice)
    SendDirect { message: WsMessage },
    Close {
        code: u16,
        reason: String,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Builder for [`RobustConnection`]
///
/// # Example
/// ```ignore
/// let conn = RobustConnection::builder("wss://api.example.com/feed", factory)
///     .reconnect_timeout(Duration::from_secs(30))
///     .reconnect_policy(FixedDelay::new(Duration::from_millis(250)))
///     .connect();
/// ```
pub struct RobustConnectionBuilder {
    url: String,
    factory: Arc<dyn ConnectionFactory>,
    reconnect_timeout: Option<Duration>,
    policy: Arc<dyn ReconnectPolicy>,
    robust_id: Option<String>,
}

impl RobustConnectionBuilder {
    pub fn new(url: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            url: url.into(),
            factory,
            reconnect_timeout: Some(DEFAULT_RECONNECT_TIMEOUT),
            policy: Arc::new(ExponentialBackoff::new(
                Duration::from_millis(500),
                Duration::from_secs(30),
            )),
            robust_id: None,
        }
    }

    /// How long after a drop to keep attempting reconnects before giving up
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = Some(timeout);
        self
    }

    /// Disable reconnection entirely: the first drop closes the connection
    pub fn no_reconnect(mut self) -> Self {
        self.reconnect_timeout = None;
        self
    }

    pub fn reconnect_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Override the generated session id
    pub fn robust_id(mut self, id: impl Into<String>) -> Self {
        self.robust_id = Some(id.into());
        self
    }

    /// Spawn the connection driver and return the handle.
    ///
    /// The handle starts in CONNECTING; the driver performs the initial
    /// connect (a single attempt, no retry) and emits `Open` or
    /// `Error` + `Close` on its event stream. Must be called within a tokio
    /// runtime.
    pub fn connect(self) -> RobustConnection {
        let robust_id = self.robust_id.unwrap_or_else(generate_robust_id);
        let state = Arc::new(AtomicReadyState::new(ReadyState::Connecting));
        let metrics = Arc::new(AtomicMetrics::new());
        let meta = Arc::new(RwLock::new(PhysicalMeta {
            url: self.url.clone(),
            ..Default::default()
        }));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            base_url: self.url,
            robust_id: robust_id.clone(),
            factory: self.factory,
            reconnect_timeout: self.reconnect_timeout,
            policy: self.policy,
            state: Arc::clone(&state),
            metrics: Arc::clone(&metrics),
            meta: Arc::clone(&meta),
            commands: command_rx,
            events: event_tx,
            physical: None,
            pending: VecDeque::new(),
            stay_closed: false,
        };
        tokio::spawn(driver.run());

        RobustConnection {
            robust_id,
            state,
            metrics,
            meta,
            commands: command_tx,
            events: event_rx,
        }
    }
}

/// A logical WebSocket connection that survives the loss of its underlying
/// physical connection.
///
/// To the consumer it looks like an ordinary WebSocket - one `Open`, a
/// stream of `Message`s, a final `Close` - but underneath it multiplexes
/// over a sequence of physical connections sharing one session id. When a
/// physical connection drops uncleanly the handle stays OPEN, emits
/// `Disconnect`, reconnects with backoff under a deadline, and emits
/// `Reconnect` once a replacement is adopted. Sends issued while no
/// physical is bound are queued and flushed at adoption, in order.
///
/// All state lives in a driver task; the handle communicates with it over
/// channels, so every transition is serialized on one task.
pub struct RobustConnection {
    robust_id: String,
    state: Arc<AtomicReadyState>,
    metrics: Arc<AtomicMetrics>,
    meta: Arc<RwLock<PhysicalMeta>>,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<RobustEvent>,
}

impl RobustConnection {
    /// Create a builder for a logical connection to `url`
    pub fn builder(
        url: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> RobustConnectionBuilder {
        RobustConnectionBuilder::new(url, factory)
    }

    /// Current logical ready state. Monotonically non-decreasing.
    #[inline]
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    /// URL of the adopted physical connection (the base URL before the
    /// first adoption)
    pub fn url(&self) -> String {
        self.meta.read().url.clone()
    }

    /// Negotiated subprotocol of the adopted physical connection
    pub fn protocol(&self) -> String {
        self.meta.read().protocol.clone()
    }

    /// Negotiated extensions of the adopted physical connection
    pub fn extensions(&self) -> String {
        self.meta.read().extensions.clone()
    }

    /// The session id shared by every physical connection of this logical
    /// connection
    pub fn robust_id(&self) -> &str {
        &self.robust_id
    }

    /// Get current metrics
    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot(self.state.get())
    }

    /// Send a message.
    ///
    /// Fails while CONNECTING (the consumer must wait for `Open`) and after
    /// CLOSING/CLOSED. While OPEN without a live physical (mid-reconnect)
    /// the message is queued and flushed at the next adoption.
    pub fn send(&self, message: WsMessage) -> Result<()> {
        match self.state.get() {
            ReadyState::Open => self
                .commands
                .send(Command::Send { message })
                .map_err(|e| RobustSocketError::ChannelSend(e.to_string())),
            state => Err(RobustSocketError::InvalidState(format!(
                "cannot send while {}",
                state
            ))),
        }
    }

    /// Forward a message only if a physical connection is currently bound.
    pub(crate) fn send_direct(&self, message: WsMessage) -> Result<()> {
        self.commands
            .send(Command::SendDirect { message })
            .map_err(|e| RobustSocketError::ChannelSend(e.to_string()))
    }

    /// Close the logical connection.
    ///
    /// No-op when already CLOSED. With a physical bound, the close is
    /// forwarded to it and the logical close completes when the physical's
    /// close event arrives; if the physical rejects the arguments the error
    /// is returned and the connection is left untouched. Without a physical
    /// the connection jumps straight to CLOSED and a close event with
    /// `was_clean == false` is synthesized.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if self.state.get() == ReadyState::Closed {
            return Ok(());
        }
        let (resp, result) = oneshot::channel();
        if self
            .commands
            .send(Command::Close {
                code,
                reason: reason.to_string(),
                resp,
            })
            .is_err()
        {
            // driver already finished
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

    pub(crate) fn shared_state(&self) -> Arc<AtomicReadyState> {
        Arc::clone(&self.state)
    }

    pub(crate) fn shared_metrics(&self) -> Arc<AtomicMetrics> {
        Arc::clone(&self.metrics)
    }

    pub(crate) fn shared_meta(&self) -> Arc<RwLock<PhysicalMeta>> {
        Arc::clone(&self.meta)
    }
}

enum Established {
    Adopted,
    Failed(RobustSocketError),
    /// `close()` or a dropped handle ended the connection mid-establish
    Finished,
}

enum Step {
    Physical(Option<PhysicalEvent>),
    Command(Option<Command>),
}

struct Driver {
    base_url: String,
    robust_id: String,
    factory: Arc<dyn ConnectionFactory>,
    reconnect_timeout: Option<Duration>,
    policy: Arc<dyn ReconnectPolicy>,
    state: Arc<AtomicReadyState>,
    metrics: Arc<AtomicMetrics>,
    meta: Arc<RwLock<PhysicalMeta>>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RobustEvent>,
    physical: Option<Box<dyn PhysicalConnection>>,
    pending: VecDeque<WsMessage>,
    stay_closed: bool,
}

impl Driver {
    async fn run(mut self) {
        // Initial connect is a single attempt: a deadline already in the
        // past puts the retry loop in one-shot mode.
        match self.establish(Instant::now(), true).await {
            Established::Adopted => {
                self.state.advance(ReadyState::Open);
                info!("connected to {}", self.meta.read().url);
                self.emit(RobustEvent::Open);
            }
            Established::Failed(error) => {
                warn!("initial connect failed: {}", error);
                self.emit(RobustEvent::Error(error.to_string()));
                self.finish(CloseEvent::abnormal());
                return;
            }
            Established::Finished => return,
        }

        loop {
            let step = {
                let physical = self
                    .physical
                    .as_mut()
                    .expect("open loop requires a bound physical");
                tokio::select! {
                    event = physical.recv() => Step::Physical(event),
                    command = self.commands.recv() => Step::Command(command),
                }
            };
            match step {
                Step::Physical(Some(PhysicalEvent::Open)) => {}
                Step::Physical(Some(PhysicalEvent::Message(message))) => {
                    self.metrics.increment_received();
                    self.emit(RobustEvent::Message(message));
                }
                Step::Physical(Some(PhysicalEvent::Error(error))) => {
                    self.emit(RobustEvent::Error(error));
                }
                Step::Physical(Some(PhysicalEvent::Close(event))) => {
                    if self.handle_physical_close(event).await {
                        return;
                    }
                }
                Step::Physical(None) => {
                    // stream ended without a close frame
                    if self.handle_physical_close(CloseEvent::abnormal()).await {
                        return;
                    }
                }
                Step::Command(Some(command)) => {
                    if self.handle_command(command) {
                        return;
                    }
                }
                Step::Command(None) => {
                    debug!("all handles dropped, shutting down");
                    return;
                }
            }
        }
    }

    /// React to the bound physical connection going away. Returns true when
    /// the driver is done.
    async fn handle_physical_close(&mut self, event: CloseEvent) -> bool {
        self.physical = None;

        if self.stay_closed {
            self.finish(event);
            return true;
        }
        // A clean close ends the logical connection - except the debug
        // escape code, which forces a reconnect even when clean.
        if event.was_clean && event.code != CLOSE_FORCE_RECONNECT {
            self.finish(event);
            return true;
        }
        let timeout = match self.reconnect_timeout {
            Some(timeout) => timeout,
            None => {
                debug!("reconnect disabled, closing after drop");
                self.finish(event);
                return true;
            }
        };

        info!(
            "physical connection lost (code {}), reconnecting",
            event.code
        );
        self.emit(RobustEvent::Disconnect);

        match self.establish(Instant::now() + timeout, false).await {
            Established::Adopted => {
                self.metrics.increment_reconnects();
                self.emit(RobustEvent::Reconnect);
                self.drain_pending();
                false
            }
            Established::Failed(error) => {
                // No error event here: only the initial connect reports
                // failure through the error channel.
                warn!("reconnect failed: {}", error);
                self.finish(CloseEvent::abnormal());
                true
            }
            Established::Finished => true,
        }
    }

    /// Connect (and wait for OPEN) under `deadline`, serving commands all
    /// the while.
    async fn establish(&mut self, deadline: Instant, first_attempt: bool) -> Established {
        let key = if first_attempt {
            NEW_SESSION_PARAM
        } else {
            RESUME_SESSION_PARAM
        };
        let url = append_query_param(&self.base_url, key, &self.robust_id);
        debug!("connecting to {}", url);

        let factory = Arc::clone(&self.factory);
        let policy = Arc::clone(&self.policy);
        let connect = async move {
            retry_until(deadline, policy.as_ref(), move |_attempt| {
                let factory = Arc::clone(&factory);
                let url = url.clone();
                async move {
                    let mut physical = factory.connect(&url).await?;
                    await_open(physical.as_mut()).await?;
                    Ok(physical)
                }
            })
            .await
        };
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(physical) => {
                            self.adopt(physical);
                            Established::Adopted
                        }
                        Err(error) => Established::Failed(error),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send { message }) => {
                        if self.state.get() == ReadyState::Open {
                            self.pending.push_back(message);
                        } else {
                            warn!("dropping send issued before the connection opened");
                        }
                    }
                    Some(Command::SendDirect { .. }) => {
                        debug!("no physical bound, dropping direct send");
                    }
                    Some(Command::Close { code, reason, resp }) => {
                        // Closing with no physical bound: jump straight to
                        // CLOSED. Dropping the in-flight connect tears down
                        // any physical the factory later produces.
                        self.stay_closed = true;
                        let _ = resp.send(Ok(()));
                        self.finish(CloseEvent::new(code, reason, false));
                        return Established::Finished;
                    }
                    None => {
                        debug!("all handles dropped during connect");
                        return Established::Finished;
                    }
                }
            }
        }
    }

    fn adopt(&mut self, physical: Box<dyn PhysicalConnection>) {
        assert!(
            self.physical
                .as_ref()
                .map_or(true, |previous| previous.ready_state().is_past_open()),
            "cannot adopt a physical connection while the previous one is live"
        );
        {
            let mut meta = self.meta.write();
            meta.url = physical.url();
            meta.protocol = physical.protocol();
            meta.extensions = physical.extensions();
        }
        debug!("adopted physical connection to {}", physical.url());
        self.physical = Some(physical);
    }

    fn drain_pending(&mut self) {
        let physical = match self.physical.as_mut() {
            Some(physical) => physical,
            None => return,
        };
        while let Some(message) = self.pending.pop_front() {
            match physical.send(message) {
                Ok(()) => self.metrics.increment_sent(),
                Err(error) => warn!("failed to flush queued message: {}", error),
            }
        }
    }

    /// Returns true when the driver is done.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send { message } => {
                match self.physical.as_mut() {
                    Some(physical) => match physical.send(message) {
                        Ok(()) => self.metrics.increment_sent(),
                        Err(error) => warn!("send failed: {}", error),
                    },
                    None => self.pending.push_back(message),
                }
                false
            }
            Command::SendDirect { message } => {
                match self.physical.as_mut() {
                    Some(physical) => match physical.send(message) {
                        Ok(()) => self.metrics.increment_sent(),
                        Err(error) => warn!("send failed: {}", error),
                    },
                    None => debug!("no physical bound, dropping direct send"),
                }
                false
            }
            Command::Close { code, reason, resp } => self.handle_close_command(code, reason, resp),
        }
    }

    fn handle_close_command(
        &mut self,
        code: u16,
        reason: String,
        resp: oneshot::Sender<Result<()>>,
    ) -> bool {
        match self.physical.as_mut() {
            Some(physical) => {
                self.stay_closed = true;
                match physical.close(code, &reason) {
                    Ok(()) => {
                        if self.state.get() < ReadyState::Closing {
                            self.state.advance(ReadyState::Closing);
                        }
                        let _ = resp.send(Ok(()));
                        // the physical's close event finishes the job
                        false
                    }
                    Err(error) => {
                        // Rejected close arguments leave the connection
                        // untouched, including its willingness to reconnect.
                        self.stay_closed = false;
                        let _ = resp.send(Err(error));
                        false
                    }
                }
            }
            None => {
                let _ = resp.send(Ok(()));
                self.finish(CloseEvent::new(code, reason, false));
                true
            }
        }
    }

    fn finish(&mut self, event: CloseEvent) {
        self.physical = None;
        self.state.advance(ReadyState::Closed);
        debug!(
            "logical connection closed: code {} clean {}",
            event.code, event.was_clean
        );
        self.emit(RobustEvent::Close(event));
    }

    fn emit(&self, event: RobustEvent) {
        let _ = self.events.send(event);
    }
}
