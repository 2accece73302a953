//! Bus configuration and inbox types.

use crate::types::PresenceChanged;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of undelivered events an inbox may hold.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Default limit on concurrently registered subscriptions.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 4096;

/// Configuration for an event bus.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Max buffered events per subscription before the oldest is evicted.
    /// Default: 256
    pub inbox_capacity: usize,

    /// Max registered subscriptions; `subscribe` fails beyond it.
    /// Default: 4096
    pub max_subscriptions: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Inboxes the event was enqueued into.
    pub delivered: usize,
    /// Of those, inboxes that had to evict their oldest event first.
    pub lagged: usize,
}

/// What a consumer pulls out of its inbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboxEvent {
    /// The next presence change, in publish order.
    Presence(PresenceChanged),
    /// `count` older events were evicted because the inbox was full.
    Missed { count: u64 },
}

/// Consumer side of a subscription's bounded queue.
pub struct Inbox {
    receiver: Receiver<PresenceChanged>,
    missed: Arc<AtomicU64>,
}

impl Inbox {
    pub(crate) fn new(receiver: Receiver<PresenceChanged>, missed: Arc<AtomicU64>) -> Self {
        Self { receiver, missed }
    }

    /// Raw receiver, for use in `crossbeam_channel::select!`.
    ///
    /// Events taken directly from here bypass the missed-event notice;
    /// pair with [`Inbox::take_missed`].
    pub fn receiver(&self) -> &Receiver<PresenceChanged> {
        &self.receiver
    }

    /// Number of events evicted since the last call, resetting the count.
    pub fn take_missed(&self) -> u64 {
        self.missed.swap(0, Ordering::AcqRel)
    }

    /// Try to receive without blocking.
    pub fn try_recv(&self) -> Result<InboxEvent, TryRecvError> {
        let count = self.take_missed();
        if count > 0 {
            return Ok(InboxEvent::Missed { count });
        }
        self.receiver.try_recv().map(InboxEvent::Presence)
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<InboxEvent, RecvTimeoutError> {
        let count = self.take_missed();
        if count > 0 {
            return Ok(InboxEvent::Missed { count });
        }
        self.receiver.recv_timeout(timeout).map(InboxEvent::Presence)
    }

    /// Drop everything currently buffered. Returns how many events were dropped.
    pub fn discard(&self) -> usize {
        self.receiver.try_iter().count()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
