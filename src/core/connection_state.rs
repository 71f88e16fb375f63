use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// State of a connection, logical or physical.
///
/// Mirrors the standard WebSocket contract: the four values are ordered,
/// and a *logical* connection's state only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            3 => ReadyState::Closed,
            _ => unreachable!("ready state stored out of range"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        }
    }

    /// True for CLOSING and CLOSED
    pub fn is_past_open(&self) -> bool {
        *self >= ReadyState::Closing
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free ready state shared between a connection handle and its driver.
///
/// The state is monotonic: attempting to move it backwards is a programmer
/// error and panics.
#[derive(Debug)]
pub struct AtomicReadyState(AtomicU8);

impl AtomicReadyState {
    pub fn new(initial: ReadyState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    #[inline]
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advance to `next`. Panics if `next` is behind the current state.
    pub fn advance(&self, next: ReadyState) {
        let previous = self.0.fetch_max(next as u8, Ordering::AcqRel);
        assert!(
            previous <= next as u8,
            "ready state may not move backwards: {} -> {}",
            ReadyState::from_u8(previous),
            next
        );
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.get() == ReadyState::Open
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.get() == ReadyState::Closed
    }
}

/// Atomic counters tracking connection activity
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    reconnects: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, ready_state: ReadyState) -> Metrics {
        Metrics {
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            reconnect_count: self.reconnect_count(),
            ready_state,
        }
    }
}

/// Connection metrics snapshot
#[derive(Debug, Clone)]
pub struct Metrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u64,
    pub ready_state: ReadyState,
}
