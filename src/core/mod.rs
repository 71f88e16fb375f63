//! Core of the logical connection: state machine, resume buffer, decorator.

pub mod buffer;
pub mod connection_state;
pub mod robust;
pub mod resend;

// Re-export main types
pub use buffer::MessageBuffer;
pub use connection_state::{AtomicMetrics, AtomicReadyState, Metrics, ReadyState};
pub use resend::BufferedResendConnection;
pub use robust::{
    RobustConnection, RobustConnectionBuilder, RobustEvent, ROBUST_ID_LEN,
};
