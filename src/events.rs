use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

/// Event represents everything observable about the lifecycle of the
/// supervised servers: process launches, PID discovery, role changes, ZAP
/// restarts and terminations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The child process was spawned; no PID or role known yet.
    ServerStarted(ServerData),
    /// The server reported its PID on stdout.
    PidDiscovered(ServerData, u32),
    /// The server announced it came up as the active node.
    ServerActive(ServerData),
    /// The server announced it moved to passive-standby.
    ServerPassive(ServerData),
    /// The server announced a self-restart; its PID is forgotten until it
    /// reports a fresh one.
    ServerZapped(ServerData),
    /// The child process exited. `expected` is true when a stop() preceded
    /// the exit.
    ServerTerminated(ServerData, bool),
}

/// ServerData names the server an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerData {
    /// The cluster-unique server name.
    pub name: String,
}

/// NotifyFn delivers one event to an interested listener. Delivery happens
/// on the stdout-reader and exit-watcher tasks, so listeners must return
/// quickly; blocking here stalls log consumption for that server.
type NotifyFn = Box<dyn Fn(Event) + Send + Sync>;

/// EventNotifier is handed to supervisors so they can publish lifecycle
/// events without knowing who listens.
#[derive(Clone)]
pub struct EventNotifier(Arc<NotifyFn>);

impl EventNotifier {
    /// Wraps an arbitrary listener function.
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        EventNotifier(Arc::new(Box::new(notify)))
    }

    /// A notifier that forwards every event into an unbounded channel.
    /// Unbounded keeps the send non-blocking on the reader tasks.
    pub fn from_mpsc(sender: mpsc::UnboundedSender<Event>) -> Self {
        Self::new(move |ev: Event| {
            let _ = sender.send(ev);
        })
    }

    /// The non-test default: events go to the harness log.
    pub fn log() -> Self {
        Self::new(|ev: Event| tracing::info!(event = ?ev, "server lifecycle"))
    }

    fn notify(&self, ev: Event) {
        (self.0)(ev)
    }

    pub(crate) fn server_started(&self, name: impl Into<String>) {
        self.notify(Event::ServerStarted(ServerData { name: name.into() }))
    }

    pub(crate) fn pid_discovered(&self, name: impl Into<String>, pid: u32) {
        self.notify(Event::PidDiscovered(ServerData { name: name.into() }, pid))
    }

    pub(crate) fn server_active(&self, name: impl Into<String>) {
        self.notify(Event::ServerActive(ServerData { name: name.into() }))
    }

    pub(crate) fn server_passive(&self, name: impl Into<String>) {
        self.notify(Event::ServerPassive(ServerData { name: name.into() }))
    }

    pub(crate) fn server_zapped(&self, name: impl Into<String>) {
        self.notify(Event::ServerZapped(ServerData { name: name.into() }))
    }

    pub(crate) fn server_terminated(&self, name: impl Into<String>, expected: bool) {
        self.notify(Event::ServerTerminated(
            ServerData { name: name.into() },
            expected,
        ))
    }
}

////////////////////////////////////////////////////////////////////////////////

/// EventBufferCollector accumulates every published event so tests can
/// assert on what happened, and in which order.
pub struct EventBufferCollector {
    events: Arc<Mutex<Vec<Event>>>,
    _join_handle: JoinHandle<()>,
}

impl EventBufferCollector {
    /// Drains a channel produced by [`EventNotifier::from_mpsc`] into a
    /// shared buffer.
    pub fn from_mpsc(receiver: mpsc::UnboundedReceiver<Event>) -> EventBufferCollector {
        let events = Arc::new(Mutex::new(Vec::new()));
        let join_handle = task::spawn(run_event_collector(events.clone(), receiver));
        EventBufferCollector {
            events,
            _join_handle: join_handle,
        }
    }

    /// The events observed so far, in delivery order. Per-server order
    /// mirrors that server's stdout; cross-server order is arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event buffer poisoned").clone()
    }

    /// Polls the buffer until some event satisfies the assert, or errors
    /// out after the timeout.
    pub async fn wait_till(&self, assert: EventAssert, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.events().iter().any(|ev| assert.call(ev).is_none()) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "no matching event within {timeout:?}; saw {:?}",
                    self.events()
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Checks that the accumulated events match the asserts exactly, in
    /// order. Only meaningful when a single server produced them.
    pub fn assert_exact(&self, asserts: Vec<EventAssert>) {
        let events = self.events();
        assert_eq!(events.len(), asserts.len(), "{events:?}");
        for (ev, assert) in events.iter().zip(asserts.into_iter()) {
            assert.check(ev)
        }
    }
}

async fn run_event_collector(
    events: Arc<Mutex<Vec<Event>>>,
    mut receiver: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(ev) = receiver.recv().await {
        events.lock().expect("event buffer poisoned").push(ev);
    }
}

/// Builds a notifier/collector pair for tests.
pub fn testing_event_notifier() -> (EventNotifier, EventBufferCollector) {
    let (send_ev, rx_ev) = mpsc::unbounded_channel();
    let notifier = EventNotifier::from_mpsc(send_ev);
    let buffer = EventBufferCollector::from_mpsc(rx_ev);
    (notifier, buffer)
}

////////////////////////////////////////////////////////////////////////////////

/// EventAssert is a predicate over one [`Event`], reporting a description
/// of the mismatch when it does not hold.
pub struct EventAssert(Box<dyn Fn(&Event) -> Option<String> + Send + Sync>);

impl EventAssert {
    fn call(&self, ev: &Event) -> Option<String> {
        (*self.0)(ev)
    }

    /// Panics with the mismatch description when the event does not satisfy
    /// the assert.
    pub fn check(&self, ev: &Event) {
        if let Some(err_msg) = self.call(ev) {
            panic!("EventAssert failed: {}", err_msg);
        }
    }

    fn named(
        expected: &'static str,
        input_name: String,
        matcher: impl Fn(&Event) -> Option<&ServerData> + Send + Sync + 'static,
    ) -> EventAssert {
        EventAssert(Box::new(move |ev| match matcher(ev) {
            Some(data) if data.name == input_name => None,
            Some(_) => Some(format!(
                "Expecting {expected} for {input_name}; got {ev:?} instead"
            )),
            None => Some(format!("Expecting {expected}; got {ev:?} instead")),
        }))
    }

    /// Asserts a [`Event::ServerStarted`] for the given server.
    pub fn server_started(name: impl Into<String>) -> EventAssert {
        Self::named("ServerStarted", name.into(), |ev| match ev {
            Event::ServerStarted(data) => Some(data),
            _ => None,
        })
    }

    /// Asserts a [`Event::PidDiscovered`] for the given server, any PID.
    pub fn pid_discovered(name: impl Into<String>) -> EventAssert {
        Self::named("PidDiscovered", name.into(), |ev| match ev {
            Event::PidDiscovered(data, _) => Some(data),
            _ => None,
        })
    }

    /// Asserts a [`Event::ServerActive`] for the given server.
    pub fn server_active(name: impl Into<String>) -> EventAssert {
        Self::named("ServerActive", name.into(), |ev| match ev {
            Event::ServerActive(data) => Some(data),
            _ => None,
        })
    }

    /// Asserts a [`Event::ServerPassive`] for the given server.
    pub fn server_passive(name: impl Into<String>) -> EventAssert {
        Self::named("ServerPassive", name.into(), |ev| match ev {
            Event::ServerPassive(data) => Some(data),
            _ => None,
        })
    }

    /// Asserts a [`Event::ServerZapped`] for the given server.
    pub fn server_zapped(name: impl Into<String>) -> EventAssert {
        Self::named("ServerZapped", name.into(), |ev| match ev {
            Event::ServerZapped(data) => Some(data),
            _ => None,
        })
    }

    /// Asserts a [`Event::ServerTerminated`] for the given server with the
    /// given expectedness.
    pub fn server_terminated(name: impl Into<String>, expected: bool) -> EventAssert {
        let input_name = name.into();
        EventAssert(Box::new(move |ev| match ev {
            Event::ServerTerminated(data, was_expected) => {
                if data.name != input_name {
                    Some(format!(
                        "Expecting ServerTerminated for {input_name}; got {ev:?} instead"
                    ))
                } else if *was_expected != expected {
                    Some(format!(
                        "Expecting ServerTerminated(expected={expected}); got {ev:?} instead"
                    ))
                } else {
                    None
                }
            }
            _ => Some(format!("Expecting ServerTerminated; got {ev:?} instead")),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collector_preserves_order() {
        let (notifier, buffer) = testing_event_notifier();
        notifier.server_started("s1");
        notifier.pid_discovered("s1", 4242);
        notifier.server_active("s1");
        notifier.server_terminated("s1", true);

        buffer
            .wait_till(
                EventAssert::server_terminated("s1", true),
                Duration::from_millis(250),
            )
            .await
            .expect("event should arrive");

        buffer.assert_exact(vec![
            EventAssert::server_started("s1"),
            EventAssert::pid_discovered("s1"),
            EventAssert::server_active("s1"),
            EventAssert::server_terminated("s1", true),
        ]);
    }

    #[tokio::test]
    async fn test_wait_till_times_out() {
        let (notifier, buffer) = testing_event_notifier();
        notifier.server_started("s1");
        let result = buffer
            .wait_till(EventAssert::server_active("s1"), Duration::from_millis(50))
            .await;
        assert!(result.is_err(), "expected timeout, got {result:?}");
    }

    #[test]
    fn test_assert_mismatch_reports_name() {
        let assert = EventAssert::server_active("s1");
        let err = assert
            .call(&Event::ServerActive(ServerData { name: "s2".into() }))
            .expect("mismatch should produce a message");
        assert!(err.contains("s1"), "{err}");
    }
}
