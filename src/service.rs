//! Presence service tying the roster, the bus and the sessions together.

use crate::bus::{BusConfig, EventBus, PublishReport};
use crate::error::Result;
use crate::roster::PresenceStore;
use crate::session::{
    DisconnectSignal, MessageSink, SessionConfig, SessionHandle, SessionId, SessionManager,
};
use crate::types::{ColleagueId, PresenceChanged};
use parking_lot::Mutex;
use std::sync::Arc;

/// Service configuration.
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub bus: BusConfig,
    pub session: SessionConfig,
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceStats {
    /// Subscriptions registered on the bus.
    pub subscriptions: usize,
    /// Sessions currently streaming.
    pub sessions: usize,
}

/// Entry point for the HTTP layer.
///
/// Create one per process at startup and share it (it is `Send + Sync`).
/// Mutating requests call `update_presence` (or write the store themselves
/// and call `publish_presence_changed`); streaming requests call
/// `open_stream_session`.
pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    bus: EventBus,
    sessions: SessionManager,
    /// Held across store write and publish, so deltas leave in write order.
    mutation_lock: Mutex<()>,
}

impl PresenceService {
    pub fn new(store: Arc<dyn PresenceStore>, config: ServiceConfig) -> Self {
        let bus = EventBus::new(config.bus);
        let sessions = SessionManager::new(bus.clone(), Arc::clone(&store), config.session);
        Self {
            store,
            bus,
            sessions,
            mutation_lock: Mutex::new(()),
        }
    }

    /// Notify every streaming client that a presence flag changed.
    ///
    /// Call only after the store write has been applied. Callers that write
    /// the store themselves must order concurrent writes to one colleague
    /// the same way they publish them; `update_presence` does this for you.
    pub fn publish_presence_changed(&self, id: ColleagueId, is_at_work: bool) -> PublishReport {
        self.bus.publish(PresenceChanged::new(id, is_at_work))
    }

    /// Write a presence flag to the store, then publish the change.
    ///
    /// Nothing is published if the store write fails. Concurrent updates
    /// are serialised, so the last delta a client sees for a colleague is
    /// the value the store ended up with.
    pub fn update_presence(&self, id: ColleagueId, is_at_work: bool) -> Result<PublishReport> {
        let _mutation = self.mutation_lock.lock();
        self.store.set_presence(id, is_at_work)?;
        tracing::debug!(colleague = %id, is_at_work, "presence updated");
        Ok(self.publish_presence_changed(id, is_at_work))
    }

    /// Start streaming to a newly connected client.
    pub fn open_stream_session<S>(&self, sink: S, signal: DisconnectSignal) -> Result<SessionHandle>
    where
        S: MessageSink + 'static,
    {
        self.sessions.open(sink, signal)
    }

    /// Stop a session. Returns false if it had already ended.
    pub fn close_stream_session(&self, id: SessionId) -> bool {
        self.sessions.close(id)
    }

    /// Close every session, then the bus.
    pub fn shutdown(&self) {
        let sessions = self.sessions.shutdown();
        let subscriptions = self.bus.close();
        tracing::info!(sessions, subscriptions, "presence service shut down");
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            subscriptions: self.bus.subscription_count(),
            sessions: self.sessions.active_sessions(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }
}
