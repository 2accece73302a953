//! Process-wide presence event bus.

use crate::error::{RelayError, Result};
use crate::types::PresenceChanged;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::types::{BusConfig, Inbox, PublishReport, SubscriptionId};

/// Bus-side state of one subscription.
struct Slot {
    sender: Sender<PresenceChanged>,
    /// Receiver clone used only to evict the oldest event when full.
    evictor: Receiver<PresenceChanged>,
    missed: Arc<AtomicU64>,
}

impl Slot {
    /// Enqueue without blocking. Returns true if older events had to be evicted.
    fn deliver(&self, mut event: PresenceChanged) -> bool {
        let mut lagged = false;
        loop {
            match self.sender.try_send(event) {
                Ok(()) => return lagged,
                Err(TrySendError::Full(back)) => {
                    // The consumer may have drained concurrently; only count real evictions.
                    if self.evictor.try_recv().is_ok() {
                        self.missed.fetch_add(1, Ordering::AcqRel);
                    }
                    lagged = true;
                    event = back;
                }
                // The slot owns a receiver, so this cannot happen while it is registered.
                Err(TrySendError::Disconnected(_)) => return lagged,
            }
        }
    }
}

pub(crate) struct BusShared {
    config: BusConfig,
    slots: RwLock<HashMap<SubscriptionId, Slot>>,
    next_id: AtomicU64,
    /// Serialises publishers so every inbox sees the same publish order.
    publish_lock: Mutex<()>,
    closed: AtomicBool,
}

impl BusShared {
    fn remove(&self, id: SubscriptionId) -> bool {
        let removed = self.slots.write().remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = %id, "unsubscribed");
        }
        removed
    }
}

/// Fan-out registry for presence changes.
///
/// Cloning is cheap and every clone refers to the same bus. Create one per
/// process at wiring time and hand clones to whoever publishes or streams.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Create a new bus.
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                config,
                slots: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                publish_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscription with an empty inbox.
    ///
    /// Only events published after this returns are delivered to it.
    pub fn subscribe(&self) -> Result<Subscription> {
        let mut slots = self.shared.slots.write();

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RelayError::BusClosed);
        }

        let limit = self.shared.config.max_subscriptions;
        if slots.len() >= limit {
            tracing::warn!(limit, "subscription rejected: bus at capacity");
            return Err(RelayError::SubscriptionCapacity { limit });
        }

        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.shared.config.inbox_capacity.max(1));
        let missed = Arc::new(AtomicU64::new(0));

        slots.insert(
            id,
            Slot {
                sender,
                evictor: receiver.clone(),
                missed: Arc::clone(&missed),
            },
        );
        drop(slots);

        tracing::debug!(subscription = %id, "subscribed");

        Ok(Subscription {
            id,
            inbox: Inbox::new(receiver, missed),
            bus: Arc::downgrade(&self.shared),
            active: true,
        })
    }

    /// Remove a subscription. Returns whether it was still registered.
    ///
    /// Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.remove(id)
    }

    /// Deliver `event` to every registered inbox without blocking.
    pub fn publish(&self, event: PresenceChanged) -> PublishReport {
        let _order = self.shared.publish_lock.lock();
        let slots = self.shared.slots.read();

        let mut report = PublishReport::default();
        for (id, slot) in slots.iter() {
            if slot.deliver(event) {
                report.lagged += 1;
                tracing::warn!(subscription = %id, "inbox full, evicted oldest event");
            }
            report.delivered += 1;
        }

        tracing::trace!(
            colleague = %event.colleague_id,
            is_at_work = event.is_at_work,
            delivered = report.delivered,
            "published presence change"
        );

        report
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.shared.slots.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Drop every subscription and refuse new ones.
    ///
    /// Inboxes of dropped subscriptions report disconnection once drained.
    /// Returns how many subscriptions were removed.
    pub fn close(&self) -> usize {
        let mut slots = self.shared.slots.write();
        self.shared.closed.store(true, Ordering::Release);
        let count = slots.len();
        slots.clear();
        tracing::info!(removed = count, "event bus closed");
        count
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// A live registration on the bus.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    inbox: Inbox,
    bus: Weak<BusShared>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Unsubscribe explicitly. Returns whether the bus still had it.
    pub fn unsubscribe(mut self) -> bool {
        self.active = false;
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            if let Some(bus) = self.bus.upgrade() {
                bus.remove(self.id);
            }
        }
    }
}
