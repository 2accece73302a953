//! Stream sessions: one long-lived client connection each.
//!
//! A session goes `Opening → Streaming → Closing → Closed`:
//! - subscribe to the bus, then read and write the `initial` snapshot
//! - relay deltas in inbox order and emit heartbeats on a fixed interval
//! - on disconnect, write failure or server close, unsubscribe exactly
//!   once, stop the heartbeat and release the transport
//!
//! Transports plug in through [`MessageSink`] and [`DisconnectSignal`].
//!
//! # Example
//!
//! ```ignore
//! let manager = SessionManager::new(bus.clone(), roster, SessionConfig::default());
//! let (notifier, signal) = disconnect_signal();
//!
//! let handle = manager.open(SseSink::new(socket), signal)?;
//!
//! // ... later, when the client hangs up:
//! notifier.notify();
//! handle.wait_closed(Duration::from_secs(1));
//! ```

mod manager;
mod signal;
mod sink;
mod types;

pub use manager::SessionManager;
pub use signal::{disconnect_signal, DisconnectNotifier, DisconnectSignal};
pub use sink::{ChannelSink, MessageSink, SseSink};
pub use types::{
    CloseReason, SessionConfig, SessionHandle, SessionId, SessionState,
    DEFAULT_HEARTBEAT_INTERVAL,
};
