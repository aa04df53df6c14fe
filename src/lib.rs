#![deny(missing_docs)]

//! The corral crate offers the core of an integration-test harness for
//! clustered server deployments (one active node, zero or more
//! passive-standby replicas) which sits on top of the tokio runtime. The
//! crate provides:
//!
//! * A `ServerSupervisor` type owning one server child process: launch
//!   environment, stdout event scraping, PID discovery, kill, and
//!   expected-versus-unexpected exit classification
//! * A `StateInterlock` registry classifying every server into a lifecycle
//!   state and exposing blocking predicates over the aggregate ("wait until
//!   some server is active", "wait until none are settling")
//! * A `ProcessControl` facade serializing test-client operations (restart
//!   the active, wait for passives, shut the cluster down) against that
//!   state
//! * A `TestStateSink` collecting the first-wins pass/fail verdict, which
//!   every blocking wait observes so a single unexpected crash fails the
//!   test deterministically

/// Per-server identity and the cluster endpoint descriptor.
mod config;

/// The serialized, test-facing control operations.
mod control;

/// The harness error taxonomy.
mod errors;

/// Provides an API to notify and collect lifecycle events of the supervised
/// servers; the buffer collector doubles as the test suite's assertion
/// vehicle.
mod events;

/// The shared state registry and its blocking predicates.
mod interlock;

/// The per-server child-process supervisor.
mod server;

/// The terminal pass/fail sink.
mod sink;

/// The write-through stdout scanner that turns log lines into events.
mod stream;

pub use config::CommandSupplier;
pub use config::ClusterInfo;
pub use config::ServerInfo;
pub use config::ServerSpec;
pub use control::ProcessControl;
pub use errors::HarnessError;
pub use events::testing_event_notifier;
pub use events::Event;
pub use events::EventAssert;
pub use events::EventBufferCollector;
pub use events::EventNotifier;
pub use events::ServerData;
pub use interlock::ServerState;
pub use interlock::StateInterlock;
pub use server::ServerSupervisor;
pub use sink::FailureRecord;
pub use sink::TestStateSink;
pub use sink::Verdict;
pub use stream::EventHandler;
pub use stream::EventMap;
pub use stream::LogEventStream;
