//! Transport-agnostic disconnect signal.

use crossbeam_channel::{bounded, never, Receiver, Sender, TryRecvError};

/// Create a linked notifier/signal pair.
///
/// The transport layer keeps the notifier and fires it (or drops it) when
/// the client goes away; the session watches the signal.
pub fn disconnect_signal() -> (DisconnectNotifier, DisconnectSignal) {
    let (sender, receiver) = bounded(1);
    (DisconnectNotifier { sender }, DisconnectSignal { receiver })
}

/// Transport side of a disconnect signal. Dropping it also fires the signal.
pub struct DisconnectNotifier {
    sender: Sender<()>,
}

impl DisconnectNotifier {
    /// Report that the client disconnected.
    pub fn notify(self) {
        let _ = self.sender.try_send(());
    }
}

/// Session side of a disconnect signal.
#[derive(Clone)]
pub struct DisconnectSignal {
    receiver: Receiver<()>,
}

impl DisconnectSignal {
    /// A signal that never fires, for transports that only fail on write.
    pub fn never() -> Self {
        Self { receiver: never() }
    }

    /// Non-blocking check.
    pub fn is_disconnected(&self) -> bool {
        !matches!(self.receiver.try_recv(), Err(TryRecvError::Empty))
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}
