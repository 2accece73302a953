//! Stream session manager: one worker thread per streaming connection.

use crate::bus::{EventBus, Subscription};
use crate::error::{RelayError, Result};
use crate::roster::PresenceStore;
use crate::types::{PresenceChanged, StreamMessage};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::signal::DisconnectSignal;
use super::sink::MessageSink;
use super::types::{
    CloseReason, SessionConfig, SessionHandle, SessionId, SessionState, SessionStatus,
};

/// Manager-side record of a running session.
struct SessionEntry {
    control: Sender<()>,
    thread: JoinHandle<()>,
}

type Registry = Mutex<HashMap<SessionId, SessionEntry>>;

/// Opens, tracks and tears down stream sessions.
///
/// Dropping the manager closes every session it still tracks.
pub struct SessionManager {
    bus: EventBus,
    store: Arc<dyn PresenceStore>,
    config: SessionConfig,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(bus: EventBus, store: Arc<dyn PresenceStore>, config: SessionConfig) -> Self {
        Self {
            bus,
            store,
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a session on `sink`, watching `signal` for disconnects.
    ///
    /// The snapshot is read and written on the caller's thread; on success
    /// the session continues on its own worker thread. The bus subscription
    /// is taken before the snapshot is read, so a change published while
    /// the client connects is either in the snapshot or relayed after it.
    ///
    /// Errors:
    /// - `SnapshotRead`: nothing was written to the sink
    /// - `TransportWrite`: the snapshot could not be written
    /// - `SubscriptionCapacity`: the snapshot and an `error` notice were written
    /// - `BusClosed`: nothing was written
    ///
    /// In every error case the sink has been closed.
    pub fn open<S>(&self, sink: S, signal: DisconnectSignal) -> Result<SessionHandle>
    where
        S: MessageSink + 'static,
    {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut sink: Box<dyn MessageSink> = Box::new(sink);
        let status = Arc::new(SessionStatus::new());

        let subscription = match self.bus.subscribe() {
            Err(RelayError::BusClosed) => {
                tracing::warn!(session = %id, "stream rejected: bus closed");
                sink.close();
                status.close(CloseReason::BusClosed);
                return Err(RelayError::BusClosed);
            }
            other => other,
        };

        let colleagues = match self.store.list_all_presence() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(session = %id, error = %e, "snapshot read failed");
                drop(subscription);
                sink.close();
                status.close(CloseReason::SnapshotFailed);
                return Err(RelayError::SnapshotRead(e.to_string()));
            }
        };

        let snapshot_len = colleagues.len();
        if let Err(e) = sink.write_message(&StreamMessage::Initial { colleagues }) {
            tracing::warn!(session = %id, error = %e, "failed to write snapshot");
            drop(subscription);
            sink.close();
            status.close(CloseReason::WriteFailed);
            return Err(e);
        }

        let subscription = match subscription {
            Ok(sub) => sub,
            Err(e) => {
                let notice = StreamMessage::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                let _ = sink.write_message(&notice);
                sink.close();
                status.close(CloseReason::ClosedByServer);
                return Err(e);
            }
        };

        let (control_tx, control_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(0);
        let handle = SessionHandle::new(id, Arc::clone(&status), done_rx);

        let worker = SessionWorker {
            id,
            subscription: Some(subscription),
            sink,
            store: Arc::clone(&self.store),
            signal,
            control: control_rx,
            config: self.config.clone(),
            status: Arc::clone(&status),
            registry: Arc::downgrade(&self.registry),
            torn_down: false,
            _done: done_tx,
        };

        status.set_state(SessionState::Streaming);

        // Hold the registry while spawning so a worker that ends immediately
        // cannot deregister before it is registered. If the spawn fails the
        // unstarted worker is dropped, which releases its subscription and
        // closes its sink.
        let mut registry = self.registry.lock();
        let thread = thread::Builder::new()
            .name(format!("presence-session-{}", id))
            .spawn(move || worker.run())
            .map_err(|e| {
                tracing::error!(session = %id, error = %e, "failed to spawn session worker");
                RelayError::Io(e)
            })?;
        registry.insert(
            id,
            SessionEntry {
                control: control_tx,
                thread,
            },
        );
        drop(registry);

        tracing::info!(session = %id, colleagues = snapshot_len, "stream session opened");
        Ok(handle)
    }

    /// Close a session and wait for its teardown to finish.
    ///
    /// Returns false if the id is unknown or the session already ended.
    pub fn close(&self, id: SessionId) -> bool {
        let entry = self.registry.lock().remove(&id);
        match entry {
            Some(entry) => {
                Self::stop(id, entry);
                true
            }
            None => false,
        }
    }

    /// Close every session. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let entries: Vec<(SessionId, SessionEntry)> = self.registry.lock().drain().collect();
        let count = entries.len();
        for (id, entry) in entries {
            Self::stop(id, entry);
        }
        if count > 0 {
            tracing::info!(closed = count, "stream sessions shut down");
        }
        count
    }

    fn stop(id: SessionId, entry: SessionEntry) {
        let _ = entry.control.try_send(());
        if entry.thread.join().is_err() {
            tracing::error!(session = %id, "session worker panicked");
        }
    }

    /// Number of sessions currently streaming.
    pub fn active_sessions(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.registry.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by a session's worker thread.
struct SessionWorker {
    id: SessionId,
    subscription: Option<Subscription>,
    sink: Box<dyn MessageSink>,
    store: Arc<dyn PresenceStore>,
    signal: DisconnectSignal,
    control: Receiver<()>,
    config: SessionConfig,
    status: Arc<SessionStatus>,
    registry: Weak<Registry>,
    /// Set once `teardown` has run.
    torn_down: bool,
    /// Dropped when the worker finishes; handles wait on it.
    _done: Sender<()>,
}

impl SessionWorker {
    fn run(mut self) {
        let heartbeat = tick(self.config.heartbeat_interval.max(Duration::from_millis(1)));
        let reason = self.stream(&heartbeat);
        self.teardown(reason, heartbeat);
    }

    fn stream(&mut self, heartbeat: &Receiver<Instant>) -> CloseReason {
        let Some(inbox) = self
            .subscription
            .as_ref()
            .map(|sub| sub.inbox().receiver().clone())
        else {
            return CloseReason::BusClosed;
        };
        let disconnect = self.signal.receiver().clone();
        let control = self.control.clone();

        loop {
            select! {
                recv(inbox) -> msg => match msg {
                    Ok(event) => {
                        if let Err(reason) = self.relay(event) {
                            return reason;
                        }
                    }
                    Err(_) => return CloseReason::BusClosed,
                },
                recv(heartbeat) -> _ => {
                    if let Err(reason) = self.write(&StreamMessage::Heartbeat) {
                        return reason;
                    }
                }
                recv(disconnect) -> _ => return CloseReason::ClientDisconnected,
                recv(control) -> _ => return CloseReason::ClosedByServer,
            }
        }
    }

    fn relay(&mut self, event: PresenceChanged) -> std::result::Result<(), CloseReason> {
        let missed = self
            .subscription
            .as_ref()
            .map(|sub| sub.inbox().take_missed())
            .unwrap_or(0);

        if missed > 0 {
            tracing::warn!(session = %self.id, missed, "session fell behind");
            self.write(&StreamMessage::MissedUpdates { missed })?;
            if self.config.resync_on_lag {
                return self.resync();
            }
        }

        tracing::debug!(
            session = %self.id,
            colleague = %event.colleague_id,
            is_at_work = event.is_at_work,
            "relaying presence change"
        );
        self.write(&StreamMessage::from(event))
    }

    /// Replace whatever is buffered with a fresh snapshot.
    ///
    /// Everything discarded was published before the snapshot is read, so
    /// the snapshot already reflects it.
    fn resync(&mut self) -> std::result::Result<(), CloseReason> {
        let discarded = self
            .subscription
            .as_ref()
            .map(|sub| sub.inbox().discard())
            .unwrap_or(0);

        let colleagues = self.store.list_all_presence().map_err(|e| {
            tracing::error!(session = %self.id, error = %e, "resync snapshot failed");
            CloseReason::SnapshotFailed
        })?;

        tracing::debug!(session = %self.id, discarded, "resynced session");
        self.write(&StreamMessage::Initial { colleagues })
    }

    fn write(&mut self, message: &StreamMessage) -> std::result::Result<(), CloseReason> {
        self.sink.write_message(message).map_err(|e| {
            tracing::warn!(
                session = %self.id,
                kind = message.kind(),
                error = %e,
                "write failed, closing session"
            );
            CloseReason::WriteFailed
        })
    }

    /// The single teardown path.
    fn teardown(mut self, reason: CloseReason, heartbeat: Receiver<Instant>) {
        self.release(reason);
        drop(heartbeat);
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }

        tracing::info!(session = %self.id, reason = ?reason, "stream session closed");
    }

    /// Unsubscribe, close the sink and record the reason, exactly once.
    fn release(&mut self, reason: CloseReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.status.set_state(SessionState::Closing);

        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.sink.close();
        self.status.close(reason);
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        // Reached without teardown only if the worker never ran or panicked.
        self.release(CloseReason::ClosedByServer);
    }
}
