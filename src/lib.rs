//! # RobustSockets
//!
//! A robust logical WebSocket connection that survives the failure and
//! replacement of its underlying physical WebSocket.
//!
//! ## Features
//!
//! - **Seamless reconnection**: the logical connection stays OPEN across
//!   physical drops, reconnecting with backoff under a deadline
//! - **Session resumption**: every physical connection of one logical
//!   connection shares a session id, announced to the server via URL
//!   parameter (`n` for new, `o` for resuming)
//! - **Buffered resend**: outbound messages are tagged with monotonic hex
//!   ids and buffered until acknowledged; after a reconnect the server's
//!   `CONTINUE` marker tells the client exactly where to resume
//! - **Pluggable transport**: the physical connection is built by a factory
//!   trait; a tokio-tungstenite implementation ships in [`transport`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use robustsockets::{BufferedResendConnection, RobustConnection, RobustEvent};
//! use robustsockets::transport::TungsteniteFactory;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> robustsockets::Result<()> {
//!     let conn = RobustConnection::builder("ws://localhost:8080/feed", Arc::new(TungsteniteFactory))
//!         .reconnect_timeout(std::time::Duration::from_secs(30))
//!         .connect();
//!     let mut conn = BufferedResendConnection::new(conn);
//!
//!     conn.send("hello").await?;
//!     while let Some(event) = conn.recv().await {
//!         match event {
//!             RobustEvent::Message(msg) => println!("got {:?}", msg),
//!             RobustEvent::Close(_) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod traits;
pub mod transport;

// Re-export all traits
pub use traits::*;

// Re-export core functionality
pub use self::core::{
    buffer, buffer::MessageBuffer, connection_state,
    connection_state::{AtomicMetrics, AtomicReadyState, Metrics, ReadyState},
    resend, resend::BufferedResendConnection, robust,
    robust::{RobustConnection, RobustConnectionBuilder, RobustEvent, ROBUST_ID_LEN},
};

// Re-export the production transport
pub use transport::TungsteniteFactory;
