//! Session configuration, identifiers and lifecycle state.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between heartbeat messages.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for stream sessions.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Interval between heartbeats, independent of event traffic.
    /// Default: 30s
    pub heartbeat_interval: Duration,

    /// After a `missedUpdates` notice, drop buffered deltas and resend a
    /// full snapshot instead of relaying what is left.
    /// Default: true
    pub resync_on_lag: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            resync_on_lag: true,
        }
    }
}

/// Unique identifier for a stream session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one streaming connection.
///
/// A session is subscribed to the bus exactly while it is `Streaming`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Snapshot being read and written.
    Opening,
    /// Relaying deltas and heartbeats.
    Streaming,
    /// Teardown in progress.
    Closing,
    /// Terminal; no further writes.
    Closed,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport signalled that the client went away.
    ClientDisconnected,
    /// A write to the transport failed.
    WriteFailed,
    /// Reading a resync snapshot failed.
    SnapshotFailed,
    /// `close` or `shutdown` was called on the manager.
    ClosedByServer,
    /// The event bus was closed underneath the session.
    BusClosed,
}

#[derive(Debug)]
struct StatusInner {
    state: SessionState,
    reason: Option<CloseReason>,
}

/// Shared lifecycle record, written by the session and read by handles.
#[derive(Debug)]
pub(crate) struct SessionStatus {
    inner: Mutex<StatusInner>,
}

impl SessionStatus {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                state: SessionState::Opening,
                reason: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.inner.lock().reason
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closed;
        inner.reason = Some(reason);
    }
}

/// Handle to a running session, returned by `SessionManager::open`.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    status: Arc<SessionStatus>,
    /// Disconnects when the session's worker has finished teardown.
    done: Receiver<()>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, status: Arc<SessionStatus>, done: Receiver<()>) -> Self {
        Self { id, status, done }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Set once the session is `Closed`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.status.reason()
    }

    /// Block until the session has fully torn down. Returns false on timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
