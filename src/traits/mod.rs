//! # RobustSockets Traits
//!
//! Core traits and types for the robustsockets logical connection:
//!
//! - **PhysicalConnection / ConnectionFactory**: the seam to the underlying
//!   WebSocket transport
//! - **ReconnectPolicy**: shaping of retry delays within the reconnect
//!   deadline
//! - **WsMessage / CloseEvent**: the frame and close-event types shared by
//!   every layer

pub mod error;
pub mod factory;
pub mod message;
pub mod reconnect;

// Re-export commonly used types
pub use error::{Result, RobustSocketError};
pub use factory::{await_open, ConnectionFactory, PhysicalConnection, PhysicalEvent};
pub use message::{
    CloseEvent, WsMessage, CLOSE_ABNORMAL, CLOSE_ACK_OUT_OF_RANGE, CLOSE_FORCE_RECONNECT,
    CLOSE_NO_STATUS, CLOSE_RESUME_HANDSHAKE_FAILED,
};
pub use reconnect::{retry_until, ExponentialBackoff, FixedDelay, ReconnectPolicy};
