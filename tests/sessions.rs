//! End-to-end stream session behaviour.

use crossbeam_channel::{bounded, Receiver, Sender};
use presence_relay::{
    disconnect_signal, BusConfig, ChannelSink, CloseReason, ColleagueId, ColleaguePresence,
    DisconnectSignal, EventBus, MemoryRoster, MessageSink, PresenceChanged, PresenceService,
    PresenceStore, RelayError, Result, ServiceConfig, SessionConfig, SessionState, SseSink,
    StreamMessage,
};
use std::io::{self, Write};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn roster(count: i64) -> Arc<MemoryRoster> {
    Arc::new(MemoryRoster::with_rows(
        (1..=count).map(|id| ColleaguePresence::new(id, format!("Colleague {id}"), true)),
    ))
}

fn quiet_config() -> ServiceConfig {
    ServiceConfig {
        session: SessionConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Replay a client's stream into the presence map it would display.
fn client_view(messages: &[StreamMessage]) -> BTreeMap<ColleagueId, bool> {
    let mut view = BTreeMap::new();
    for message in messages {
        match message {
            StreamMessage::Initial { colleagues } => {
                view = colleagues.iter().map(|c| (c.id, c.is_at_work)).collect();
            }
            StreamMessage::StatusChange {
                colleague_id,
                is_at_work,
            } => {
                view.insert(*colleague_id, *is_at_work);
            }
            _ => {}
        }
    }
    view
}

fn store_view(store: &dyn PresenceStore) -> BTreeMap<ColleagueId, bool> {
    store
        .list_all_presence()
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.is_at_work))
        .collect()
}

/// Collect messages until `count` have arrived or the wait runs out.
fn collect(rx: &Receiver<StreamMessage>, count: usize) -> Vec<StreamMessage> {
    let deadline = Instant::now() + WAIT;
    let mut messages = Vec::new();
    while messages.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(message) => messages.push(message),
            Err(_) => break,
        }
    }
    messages
}

fn kinds(messages: &[StreamMessage]) -> Vec<&'static str> {
    messages.iter().map(StreamMessage::kind).collect()
}

// --- Roster doubles ---

/// Returns a stale snapshot after a write has raced it.
///
/// The first read captures the rows, then updates colleague 1 in the
/// underlying roster and publishes the change before returning the rows it
/// captured.
struct RacingRoster {
    inner: Arc<MemoryRoster>,
    bus: OnceLock<EventBus>,
    raced: AtomicBool,
}

impl PresenceStore for RacingRoster {
    fn list_all_presence(&self) -> Result<Vec<ColleaguePresence>> {
        let stale = self.inner.list_all_presence()?;
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.inner.set_presence(ColleagueId(1), false)?;
            if let Some(bus) = self.bus.get() {
                bus.publish(PresenceChanged::new(ColleagueId(1), false));
            }
        }
        Ok(stale)
    }

    fn set_presence(&self, id: ColleagueId, is_at_work: bool) -> Result<()> {
        self.inner.set_presence(id, is_at_work)
    }
}

struct FailingRoster;

impl PresenceStore for FailingRoster {
    fn list_all_presence(&self) -> Result<Vec<ColleaguePresence>> {
        Err(RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "database unavailable",
        )))
    }

    fn set_presence(&self, id: ColleagueId, _is_at_work: bool) -> Result<()> {
        Err(RelayError::ColleagueNotFound(id))
    }
}

/// Applies a write, then takes a while to acknowledge it when the colleague
/// is marked absent.
struct SlowAckRoster {
    inner: MemoryRoster,
    delay: Duration,
}

impl PresenceStore for SlowAckRoster {
    fn list_all_presence(&self) -> Result<Vec<ColleaguePresence>> {
        self.inner.list_all_presence()
    }

    fn set_presence(&self, id: ColleagueId, is_at_work: bool) -> Result<()> {
        self.inner.set_presence(id, is_at_work)?;
        if !is_at_work {
            thread::sleep(self.delay);
        }
        Ok(())
    }
}

/// Takes `delay` to write each status change.
struct SlowSink {
    inner: ChannelSink,
    started: Sender<()>,
    delay: Duration,
}

impl MessageSink for SlowSink {
    fn write_message(&mut self, message: &StreamMessage) -> Result<()> {
        if matches!(message, StreamMessage::StatusChange { .. }) {
            let _ = self.started.send(());
            thread::sleep(self.delay);
        }
        self.inner.write_message(message)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Accepts the first frame, then times out like a stalled socket with a
/// write timeout set.
struct StallingWriter {
    frames: usize,
}

impl Write for StallingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.frames > 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.frames += 1;
        Ok(())
    }
}

/// Blocks on its first status change until the gate opens.
struct GatedSink {
    inner: ChannelSink,
    entered: Sender<()>,
    gate: Receiver<()>,
    passed: bool,
}

impl MessageSink for GatedSink {
    fn write_message(&mut self, message: &StreamMessage) -> Result<()> {
        if !self.passed && matches!(message, StreamMessage::StatusChange { .. }) {
            self.passed = true;
            let _ = self.entered.send(());
            let _ = self.gate.recv();
        }
        self.inner.write_message(message)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

// --- Lifecycle ---

#[test]
fn test_connect_then_change() {
    let service = PresenceService::new(roster(3), quiet_config());
    let (sink, rx) = ChannelSink::unbounded();

    let handle = service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();
    service.update_presence(ColleagueId(2), false).unwrap();

    let messages = collect(&rx, 2);
    assert_eq!(kinds(&messages), vec!["initial", "statusChange"]);
    assert_eq!(
        messages[1],
        StreamMessage::StatusChange {
            colleague_id: ColleagueId(2),
            is_at_work: false
        }
    );
    assert_eq!(handle.state(), SessionState::Streaming);
}

#[test]
fn test_change_during_connect_is_not_lost() {
    init_tracing();
    let inner = roster(3);
    let racing = Arc::new(RacingRoster {
        inner: Arc::clone(&inner),
        bus: OnceLock::new(),
        raced: AtomicBool::new(false),
    });
    let service = PresenceService::new(racing.clone(), quiet_config());
    let _ = racing.bus.set(service.bus().clone());

    let (sink, rx) = ChannelSink::unbounded();
    service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    let messages = collect(&rx, 2);
    assert_eq!(kinds(&messages), vec!["initial", "statusChange"]);

    // The snapshot said "at work"; the delta that raced it corrects that.
    let view = client_view(&messages);
    assert_eq!(view.get(&ColleagueId(1)), Some(&false));
    assert_eq!(view, store_view(inner.as_ref()));
}

#[test]
fn test_client_disconnect_releases_everything() {
    let service = PresenceService::new(roster(2), quiet_config());
    let (sink, rx) = ChannelSink::unbounded();
    let (notifier, signal) = disconnect_signal();

    let handle = service.open_stream_session(sink, signal).unwrap();
    assert_eq!(service.stats().sessions, 1);
    assert_eq!(service.stats().subscriptions, 1);

    notifier.notify();
    assert!(handle.wait_closed(WAIT));
    assert_eq!(handle.close_reason(), Some(CloseReason::ClientDisconnected));
    assert_eq!(service.stats().sessions, 0);
    assert_eq!(service.stats().subscriptions, 0);

    // Publishing after teardown reaches nobody and writes nothing.
    let report = service.update_presence(ColleagueId(1), false).unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(kinds(&rx.try_iter().collect::<Vec<_>>()), vec!["initial"]);
}

#[test]
fn test_close_stream_session_is_idempotent() {
    let service = PresenceService::new(roster(1), quiet_config());
    let (sink, _rx) = ChannelSink::unbounded();
    let handle = service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    assert!(service.close_stream_session(handle.id()));
    assert!(!service.close_stream_session(handle.id()));
    assert_eq!(handle.close_reason(), Some(CloseReason::ClosedByServer));
    assert_eq!(service.stats().subscriptions, 0);
}

// --- Heartbeats ---

#[test]
fn test_heartbeats_without_traffic() {
    let interval = Duration::from_millis(100);
    let service = PresenceService::new(
        roster(1),
        ServiceConfig {
            session: SessionConfig {
                heartbeat_interval: interval,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let (sink, rx) = ChannelSink::unbounded();
    let opened = Instant::now();
    let handle = service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        StreamMessage::Initial { .. }
    ));

    // Stamp each heartbeat on receipt.
    let mut stamps = vec![opened];
    for _ in 0..4 {
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), StreamMessage::Heartbeat);
        stamps.push(Instant::now());
    }

    for gap in stamps.windows(2).map(|w| w[1] - w[0]) {
        assert!(gap >= interval.mul_f64(0.8), "heartbeat too early: {gap:?}");
        assert!(gap < interval * 2, "heartbeat too late: {gap:?}");
    }

    assert!(service.close_stream_session(handle.id()));
    // The sink is released on close, so the stream ends and no heartbeat
    // outlives the session.
    thread::sleep(interval * 3);
    assert!(rx.iter().all(|m| m == StreamMessage::Heartbeat));
}

#[test]
fn test_heartbeats_unaffected_by_traffic() {
    let interval = Duration::from_millis(50);
    let service = PresenceService::new(
        roster(1),
        ServiceConfig {
            session: SessionConfig {
                heartbeat_interval: interval,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let (sink, rx) = ChannelSink::unbounded();
    service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    // Keep traffic flowing well faster than the heartbeat interval.
    let started = Instant::now();
    let mut is_at_work = true;
    while started.elapsed() < interval * 5 {
        is_at_work = !is_at_work;
        service.update_presence(ColleagueId(1), is_at_work).unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let messages: Vec<StreamMessage> = rx.try_iter().collect();
    let heartbeats = messages
        .iter()
        .filter(|m| matches!(m, StreamMessage::Heartbeat))
        .count();
    assert!(heartbeats >= 2, "only {heartbeats} heartbeats under traffic");
    assert!(messages
        .iter()
        .any(|m| matches!(m, StreamMessage::StatusChange { .. })));
}

// --- Failure paths ---

#[test]
fn test_snapshot_failure_writes_nothing() {
    init_tracing();
    let service = PresenceService::new(Arc::new(FailingRoster), quiet_config());
    let (sink, rx) = ChannelSink::unbounded();

    let result = service.open_stream_session(sink, DisconnectSignal::never());
    assert!(matches!(result, Err(RelayError::SnapshotRead(_))));

    // Sink closed without a single message; no subscription leaked.
    assert!(rx.recv_timeout(WAIT).is_err());
    assert_eq!(service.stats().subscriptions, 0);
    assert_eq!(service.stats().sessions, 0);
}

#[test]
fn test_capacity_error_after_snapshot() {
    let service = PresenceService::new(
        roster(2),
        ServiceConfig {
            bus: BusConfig {
                max_subscriptions: 1,
                ..Default::default()
            },
            ..quiet_config()
        },
    );

    let (first, _first_rx) = ChannelSink::unbounded();
    service
        .open_stream_session(first, DisconnectSignal::never())
        .unwrap();

    let (second, rx) = ChannelSink::unbounded();
    let result = service.open_stream_session(second, DisconnectSignal::never());
    assert!(matches!(
        result,
        Err(RelayError::SubscriptionCapacity { limit: 1 })
    ));

    let messages: Vec<StreamMessage> = rx.iter().collect();
    assert_eq!(kinds(&messages), vec!["initial", "error"]);
    match &messages[1] {
        StreamMessage::Error { code, .. } => assert_eq!(code, "capacity"),
        other => panic!("Expected error message, got {:?}", other),
    }
    assert_eq!(service.stats().subscriptions, 1);
}

#[test]
fn test_write_failure_only_closes_that_session() {
    init_tracing();
    let service = PresenceService::new(roster(2), quiet_config());

    let (healthy, healthy_rx) = ChannelSink::unbounded();
    let healthy_handle = service
        .open_stream_session(healthy, DisconnectSignal::never())
        .unwrap();

    let (broken, broken_rx) = ChannelSink::unbounded();
    let broken_handle = service
        .open_stream_session(broken, DisconnectSignal::never())
        .unwrap();
    drop(broken_rx);

    service.update_presence(ColleagueId(1), false).unwrap();

    assert!(broken_handle.wait_closed(WAIT));
    assert_eq!(broken_handle.close_reason(), Some(CloseReason::WriteFailed));

    let messages = collect(&healthy_rx, 2);
    assert_eq!(kinds(&messages), vec!["initial", "statusChange"]);
    assert_eq!(healthy_handle.state(), SessionState::Streaming);
    assert_eq!(service.stats().subscriptions, 1);
}

#[test]
fn test_open_after_shutdown_is_rejected() {
    let service = PresenceService::new(roster(1), quiet_config());
    service.shutdown();

    let (sink, rx) = ChannelSink::unbounded();
    let result = service.open_stream_session(sink, DisconnectSignal::never());
    assert!(matches!(result, Err(RelayError::BusClosed)));
    assert!(rx.recv_timeout(WAIT).is_err());
}

// --- Slow clients ---

#[test]
fn test_lagging_session_resyncs() {
    init_tracing();
    let inner = roster(5);
    let service = PresenceService::new(
        inner.clone(),
        ServiceConfig {
            bus: BusConfig {
                inbox_capacity: 2,
                ..Default::default()
            },
            ..quiet_config()
        },
    );

    let (channel, rx) = ChannelSink::unbounded();
    let (entered_tx, entered_rx) = bounded(1);
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let sink = GatedSink {
        inner: channel,
        entered: entered_tx,
        gate: gate_rx,
        passed: false,
    };
    service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    // The session takes the first change and stalls writing it.
    service.update_presence(ColleagueId(1), false).unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();

    // Four more changes overflow an inbox of two.
    for id in 2..=5 {
        service.update_presence(ColleagueId(id), false).unwrap();
    }
    drop(gate_tx);

    let messages = collect(&rx, 4);
    assert_eq!(
        kinds(&messages),
        vec!["initial", "statusChange", "missedUpdates", "initial"]
    );
    assert_eq!(messages[2], StreamMessage::MissedUpdates { missed: 2 });
    assert_eq!(client_view(&messages), store_view(inner.as_ref()));
}

// --- Mutation order ---

#[test]
fn test_concurrent_updates_publish_in_store_order() {
    init_tracing();
    let store = Arc::new(SlowAckRoster {
        inner: MemoryRoster::with_rows(vec![ColleaguePresence::new(7, "Grace", true)]),
        delay: Duration::from_millis(150),
    });
    let service = Arc::new(PresenceService::new(store.clone(), quiet_config()));

    let (sink, rx) = ChannelSink::unbounded();
    service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    let absent = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.update_presence(ColleagueId(7), false).unwrap())
    };
    thread::sleep(Duration::from_millis(30));
    let present = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.update_presence(ColleagueId(7), true).unwrap())
    };
    absent.join().unwrap();
    present.join().unwrap();

    let messages = collect(&rx, 3);
    assert_eq!(kinds(&messages), vec!["initial", "statusChange", "statusChange"]);
    assert_eq!(client_view(&messages), store_view(store.as_ref()));
    assert_eq!(client_view(&messages).get(&ColleagueId(7)), Some(&true));
}

// --- Blocking transports ---

#[test]
fn test_close_waits_for_in_flight_write() {
    let service = PresenceService::new(roster(1), quiet_config());
    let (channel, rx) = ChannelSink::unbounded();
    let (started_tx, started_rx) = bounded(1);
    let sink = SlowSink {
        inner: channel,
        started: started_tx,
        delay: Duration::from_millis(100),
    };
    let handle = service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    service.update_presence(ColleagueId(1), false).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    // The write in flight completes before close returns; nothing follows it.
    assert!(service.close_stream_session(handle.id()));
    assert_eq!(handle.state(), SessionState::Closed);
    let messages: Vec<StreamMessage> = rx.try_iter().collect();
    assert_eq!(kinds(&messages), vec!["initial", "statusChange"]);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_write_timeout_ends_session() {
    let service = PresenceService::new(roster(1), quiet_config());
    let sink = SseSink::new(StallingWriter { frames: 0 });
    let handle = service
        .open_stream_session(sink, DisconnectSignal::never())
        .unwrap();

    service.update_presence(ColleagueId(1), false).unwrap();

    assert!(handle.wait_closed(WAIT));
    assert_eq!(handle.close_reason(), Some(CloseReason::WriteFailed));
    assert_eq!(service.stats().subscriptions, 0);
}

// --- Churn ---

#[test]
fn test_concurrent_open_close_and_publish() {
    let service = Arc::new(PresenceService::new(roster(10), quiet_config()));

    let publisher = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            for i in 0..500 {
                service
                    .update_presence(ColleagueId(i % 10 + 1), i % 2 == 0)
                    .unwrap();
            }
        })
    };

    let clients: Vec<_> = (0..4)
        .map(|_| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for round in 0..25 {
                    let (sink, _rx) = ChannelSink::unbounded();
                    let (notifier, signal) = disconnect_signal();
                    let handle = service.open_stream_session(sink, signal).unwrap();
                    if round % 2 == 0 {
                        notifier.notify();
                        assert!(handle.wait_closed(WAIT));
                    } else {
                        service.close_stream_session(handle.id());
                    }
                }
            })
        })
        .collect();

    publisher.join().unwrap();
    for client in clients {
        client.join().unwrap();
    }

    assert_eq!(service.stats().sessions, 0);
    assert_eq!(service.stats().subscriptions, 0);
}
