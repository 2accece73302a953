//! # Presence Relay
//!
//! Real-time broadcast of colleague presence ("at work" flag) changes to
//! any number of long-lived streaming clients.
//!
//! ## Core Concepts
//!
//! - **Event Bus**: process-wide pub/sub with bounded, ordered inboxes
//! - **Stream Sessions**: snapshot, then deltas and heartbeats, then a
//!   single deterministic teardown
//! - **Roster**: the persistence collaborator that snapshots are read from
//! - **Service**: the handle the HTTP layer is wired with
//!
//! ## Example
//!
//! ```ignore
//! use presence_relay::{
//!     disconnect_signal, ColleagueId, MemoryRoster, PresenceService, ServiceConfig, SseSink,
//! };
//!
//! let service = PresenceService::new(Arc::new(MemoryRoster::new()), ServiceConfig::default());
//!
//! // Streaming request
//! let (notifier, signal) = disconnect_signal();
//! let session = service.open_stream_session(SseSink::new(socket), signal)?;
//!
//! // Mutating request
//! service.update_presence(ColleagueId(7), false)?;
//!
//! // Client hangs up
//! notifier.notify();
//! ```

pub mod bus;
pub mod error;
pub mod roster;
pub mod service;
pub mod session;
pub mod types;

// Re-exports
pub use bus::{
    BusConfig, EventBus, Inbox, InboxEvent, PublishReport, Subscription, SubscriptionId,
};
pub use error::{RelayError, Result};
pub use roster::{FileRoster, MemoryRoster, PresenceStore, RosterConfig};
pub use service::{PresenceService, ServiceConfig, ServiceStats};
pub use session::{
    disconnect_signal, ChannelSink, CloseReason, DisconnectNotifier, DisconnectSignal,
    MessageSink, SessionConfig, SessionHandle, SessionId, SessionManager, SessionState, SseSink,
};
pub use types::*;
