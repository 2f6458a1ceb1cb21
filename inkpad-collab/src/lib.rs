//! # inkpad-collab — real-time document synchronization for inkpad
//!
//! Keeps one logical document consistent across N concurrent editing
//! sessions using CRDT merge over a duplex channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      Transport       ┌──────────────┐
//! │  DocSession  │ ◄──────────────────► │ CollabServer │
//! │  (per tab)   │     Binary Proto     │  (central)   │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ MergeEngine  │                      │ MergeEngine  │
//! │  (replica)   │                      │ (authority)  │
//! └──────────────┘                      └──────┬───────┘
//!                                              │
//!                                      ┌───────┴───────┐
//!                                      │  Room fan-out │
//!                                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`transport`] — duplex channel primitive + WebSocket transport
//! - [`retry`] — bounded exponential backoff with deterministic jitter
//! - [`merge`] — convergent content engine (Yrs)
//! - [`session`] — per-document session with the reconnect state machine
//! - [`manager`] — per-tab session ownership
//! - [`server`] — reference sync server with room-based routing
//!
//! ## Guarantees
//!
//! - Concurrent edits from different sessions converge to the same content
//!   regardless of arrival order.
//! - Local edits apply synchronously and never wait on the network.
//! - Edits made while disconnected are retained and reconciled on reconnect.
//! - Reconnection is bounded: after the retry budget is spent the session
//!   reports `Failed` and never retries on its own.

pub mod manager;
pub mod merge;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use manager::SessionManager;
pub use merge::{Edit, MergeEngine, MergeError};
pub use protocol::{MessageType, PeerInfo, ProtocolError, RejectReason, SyncMessage};
pub use retry::RetryPolicy;
pub use server::{CollabServer, LocalConnector, ServerConfig, ServerError, ServerStats};
pub use session::{
    ConnectionState, DocSession, FailureReason, ReplayQueue, SessionConfig, SessionError,
    SessionEvent, SessionView,
};
pub use transport::{DuplexChannel, Transport, TransportError, WebSocketTransport};
