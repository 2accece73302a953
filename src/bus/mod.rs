//! In-memory publish/subscribe bus for presence changes.
//!
//! The bus decouples the mutation path from streaming clients:
//! - `publish` never blocks on a slow consumer
//! - each subscription has its own bounded, ordered inbox
//! - a full inbox evicts its oldest event and records a missed count
//! - `unsubscribe` is idempotent, and dropping a `Subscription` unsubscribes
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new(BusConfig::default());
//! let sub = bus.subscribe()?;
//!
//! bus.publish(PresenceChanged::new(ColleagueId(7), false));
//!
//! match sub.inbox().recv_timeout(Duration::from_secs(1)) {
//!     Ok(InboxEvent::Presence(event)) => println!("{:?}", event),
//!     Ok(InboxEvent::Missed { count }) => println!("behind by {}", count),
//!     Err(_) => {}
//! }
//! ```

mod event_bus;
mod types;

pub use event_bus::{EventBus, Subscription};
pub use types::{
    BusConfig, Inbox, InboxEvent, PublishReport, SubscriptionId, DEFAULT_INBOX_CAPACITY,
    DEFAULT_MAX_SUBSCRIPTIONS,
};
