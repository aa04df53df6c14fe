use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::config::ServerSpec;
use crate::errors::HarnessError;
use crate::events::EventNotifier;
use crate::server::ServerSupervisor;
use crate::sink::{FailureRecord, TestStateSink};

/// Lifecycle classification of one registered server, as inferred from its
/// child-process events and stdout announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not running; may be (re)started. The state every server registers in.
    Terminated,
    /// Child spawned, no PID observed yet, no role yet.
    UnknownRunning,
    /// Announced itself as the active node while its PID was known.
    Active,
    /// Announced passive-standby while its PID was known.
    Passive,
    /// Announced a self-restart; equivalent to [`ServerState::UnknownRunning`]
    /// but kept distinct for diagnostics.
    ZappedRestarting,
}

impl ServerState {
    fn is_running(self) -> bool {
        self != ServerState::Terminated
    }

    fn is_settling(self) -> bool {
        matches!(
            self,
            ServerState::UnknownRunning | ServerState::ZappedRestarting
        )
    }
}

/// The narrow capability supervisors hold on the interlock: report
/// transitions, query the running flag. No registry access, no back
/// pointer to the control layer.
pub(crate) trait RoleSink: Send + Sync {
    fn server_did_startup(&self, name: &str);
    fn server_became_active(&self, name: &str, pid: u32);
    fn server_became_passive(&self, name: &str, pid: u32);
    fn server_was_zapped(&self, name: &str);
    fn server_did_shutdown(&self, name: &str);
    fn is_running(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: ServerState,
    pid: u32,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    sealed: bool,
}

/// The monitored aggregate: the full state table plus the condition the
/// blocking predicates wait on. Mutations hold the table lock briefly and
/// never await; waiters subscribe to the epoch channel before re-checking
/// their predicate, so no transition is lost.
pub(crate) struct StateCell {
    table: Mutex<Table>,
    epoch: watch::Sender<u64>,
    sink: Arc<TestStateSink>,
}

impl StateCell {
    fn new(sink: Arc<TestStateSink>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            table: Mutex::new(Table::default()),
            epoch,
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().expect("interlock table poisoned")
    }

    fn mutate<F: FnOnce(&mut Table)>(&self, f: F) {
        {
            let mut table = self.lock();
            f(&mut table);
        }
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn seal(&self) {
        let mut table = self.lock();
        table.sealed = true;
    }

    /// A transition that can only mean the harness itself is broken: log it
    /// and fail the test, first-wins.
    fn fatal(&self, message: String) {
        tracing::error!(%message, "fatal harness state error");
        self.sink.test_did_fail(FailureRecord::new(message, None));
    }

    fn register(&self, name: &str) -> Result<(), HarnessError> {
        let mut table = self.lock();
        if table.sealed {
            return Err(HarnessError::ConfigInvalid(format!(
                "cannot register {name}: registry already sealed by a state query"
            )));
        }
        if table.entries.contains_key(name) {
            return Err(HarnessError::ConfigInvalid(format!(
                "duplicate server name: {name}"
            )));
        }
        table.entries.insert(
            name.to_owned(),
            Entry {
                state: ServerState::Terminated,
                pid: 0,
            },
        );
        Ok(())
    }

    // callers have already validated that `name` is registered
    fn transition(&self, name: &str, to: ServerState, pid: u32) {
        self.mutate(|table| {
            if let Some(entry) = table.entries.get_mut(name) {
                tracing::debug!(server = %name, from = ?entry.state, ?to, pid, "state transition");
                entry.state = to;
                entry.pid = pid;
            }
        });
    }

    async fn wait_until<T, F>(&self, what: &str, pred: F) -> Result<T, HarnessError>
    where
        F: Fn(&Table) -> Option<T>,
    {
        self.seal();
        let mut rx = self.epoch.subscribe();
        loop {
            {
                let table = self.lock();
                if let Some(value) = pred(&table) {
                    return Ok(value);
                }
            }
            // predicate satisfaction wins over the short-circuit, so orderly
            // shutdown can still observe terminations after a failure
            if let Some(failure) = self.sink.failure() {
                tracing::debug!(wait = %what, "wait aborted: test already failed");
                return Err(HarnessError::HarnessFailed(failure.message));
            }
            tokio::select! {
                changed = rx.changed() => {
                    changed.expect("epoch sender lives in the cell");
                }
                _ = self.sink.failure_signalled() => {}
            }
        }
    }
}

impl RoleSink for StateCell {
    fn server_did_startup(&self, name: &str) {
        let prior = self.state_of(name);
        match prior {
            Some(ServerState::Terminated) => {
                self.transition(name, ServerState::UnknownRunning, 0)
            }
            Some(other) => self.fatal(format!(
                "server {name} reported startup while {other:?}"
            )),
            None => self.fatal(format!("startup reported for unknown server {name}")),
        }
    }

    fn server_became_active(&self, name: &str, pid: u32) {
        enum Outcome {
            Ok,
            SecondActive(String),
            FromTerminated,
            Unknown,
        }
        let mut outcome = Outcome::Ok;
        self.mutate(|table| {
            let second = table
                .entries
                .iter()
                .find(|(other, entry)| {
                    entry.state == ServerState::Active && other.as_str() != name
                })
                .map(|(other, _)| other.clone());
            match table.entries.get_mut(name) {
                None => outcome = Outcome::Unknown,
                Some(entry) if entry.state == ServerState::Terminated => {
                    outcome = Outcome::FromTerminated
                }
                Some(entry) => {
                    if let Some(other) = second {
                        outcome = Outcome::SecondActive(other);
                    } else {
                        tracing::debug!(server = %name, pid, "state transition to Active");
                        entry.state = ServerState::Active;
                        entry.pid = pid;
                    }
                }
            }
        });
        match outcome {
            Outcome::Ok => {}
            Outcome::SecondActive(other) => self.fatal(format!(
                "server {name} became active while {other} already is"
            )),
            Outcome::FromTerminated => self.fatal(format!(
                "server {name} announced a role while terminated"
            )),
            Outcome::Unknown => {
                self.fatal(format!("role reported for unknown server {name}"))
            }
        }
    }

    fn server_became_passive(&self, name: &str, pid: u32) {
        match self.state_of(name) {
            Some(state) if state.is_running() => {
                self.transition(name, ServerState::Passive, pid)
            }
            Some(_) => self.fatal(format!(
                "server {name} announced a role while terminated"
            )),
            None => self.fatal(format!("role reported for unknown server {name}")),
        }
    }

    fn server_was_zapped(&self, name: &str) {
        match self.state_of(name) {
            Some(state) if state.is_running() => {
                self.transition(name, ServerState::ZappedRestarting, 0)
            }
            Some(_) | None => {
                // stdout is drained before the exit is processed, so a ZAP
                // after termination means a harness ordering bug
                self.fatal(format!("ZAP reported for non-running server {name}"))
            }
        }
    }

    fn server_did_shutdown(&self, name: &str) {
        match self.state_of(name) {
            Some(_) => self.transition(name, ServerState::Terminated, 0),
            None => self.fatal(format!("shutdown reported for unknown server {name}")),
        }
    }

    fn is_running(&self, name: &str) -> bool {
        self.state_of(name)
            .map(ServerState::is_running)
            .unwrap_or(false)
    }
}

impl StateCell {
    fn state_of(&self, name: &str) -> Option<ServerState> {
        self.lock().entries.get(name).map(|entry| entry.state)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Registry of every supervised server and the single authority over their
/// lifecycle classification. All blocking predicates live here; all of them
/// wake with [`HarnessError::HarnessFailed`] once the test has failed.
pub struct StateInterlock {
    cell: Arc<StateCell>,
    supervisors: Mutex<HashMap<String, Arc<ServerSupervisor>>>,
    sink: Arc<TestStateSink>,
    ev_notifier: EventNotifier,
}

impl StateInterlock {
    /// Creates an empty registry reporting failures to `sink` and lifecycle
    /// events to `ev_notifier`.
    pub fn new(sink: Arc<TestStateSink>, ev_notifier: EventNotifier) -> Self {
        Self {
            cell: Arc::new(StateCell::new(sink.clone())),
            supervisors: Mutex::new(HashMap::new()),
            sink,
            ev_notifier,
        }
    }

    /// Registers a server in the Terminated state and returns its
    /// supervisor. Fails once the registry has been sealed by the first
    /// state query, on duplicate names, and on a non-positive heap.
    pub fn register(&self, spec: ServerSpec) -> Result<Arc<ServerSupervisor>, HarnessError> {
        if spec.heap_mb == 0 {
            return Err(HarnessError::ConfigInvalid(format!(
                "server {} must have a positive heap size",
                spec.name
            )));
        }
        self.cell.register(&spec.name)?;
        let name = spec.name.clone();
        let supervisor = Arc::new(ServerSupervisor::new(
            spec,
            self.cell.clone(),
            self.sink.clone(),
            self.ev_notifier.clone(),
        ));
        self.supervisors
            .lock()
            .expect("supervisor registry poisoned")
            .insert(name, supervisor.clone());
        Ok(supervisor)
    }

    fn supervisor(&self, name: &str) -> Option<Arc<ServerSupervisor>> {
        self.supervisors
            .lock()
            .expect("supervisor registry poisoned")
            .get(name)
            .cloned()
    }

    fn require_known(&self, name: &str) -> Result<(), HarnessError> {
        if self.supervisor(name).is_none() {
            return Err(HarnessError::ConfigInvalid(format!(
                "unknown server: {name}"
            )));
        }
        Ok(())
    }

    fn snapshot_one(&self, wanted: ServerState) -> Option<Arc<ServerSupervisor>> {
        self.cell.seal();
        let name = {
            let table = self.cell.lock();
            table
                .entries
                .iter()
                .find(|(_, entry)| entry.state == wanted)
                .map(|(name, _)| name.clone())
        };
        name.and_then(|name| self.supervisor(&name))
    }

    /// Blocks until some server is Active.
    pub async fn wait_for_active(&self) -> Result<(), HarnessError> {
        self.cell
            .wait_until("active", |table| {
                table
                    .entries
                    .values()
                    .any(|entry| entry.state == ServerState::Active)
                    .then_some(())
            })
            .await
    }

    /// Blocks until no server is settling (UnknownRunning or
    /// ZappedRestarting) and at least one is Active. Zero passives is a
    /// legal ready state.
    pub async fn wait_for_all_ready(&self) -> Result<(), HarnessError> {
        self.cell
            .wait_until("all-ready", |table| {
                let settled = table
                    .entries
                    .values()
                    .all(|entry| !entry.state.is_settling());
                let one_active = table
                    .entries
                    .values()
                    .any(|entry| entry.state == ServerState::Active);
                (settled && one_active).then_some(())
            })
            .await
    }

    /// Blocks until the named server has left Terminated.
    pub async fn wait_for_server_running(&self, name: &str) -> Result<(), HarnessError> {
        self.require_known(name)?;
        self.cell
            .wait_until("server-running", |table| {
                table
                    .entries
                    .get(name)
                    .map(|entry| entry.state.is_running())
                    .unwrap_or(false)
                    .then_some(())
            })
            .await
    }

    /// Blocks until the named server is Terminated.
    pub async fn wait_for_server_termination(&self, name: &str) -> Result<(), HarnessError> {
        self.require_known(name)?;
        self.cell
            .wait_until("server-termination", |table| {
                table
                    .entries
                    .get(name)
                    .map(|entry| entry.state == ServerState::Terminated)
                    .unwrap_or(false)
                    .then_some(())
            })
            .await
    }

    /// The Active server, if any, right now.
    pub fn active_server(&self) -> Option<Arc<ServerSupervisor>> {
        self.snapshot_one(ServerState::Active)
    }

    /// Some Passive server, if any, right now.
    pub fn one_passive_server(&self) -> Option<Arc<ServerSupervisor>> {
        self.snapshot_one(ServerState::Passive)
    }

    /// Some Terminated server, if any, right now.
    pub fn one_terminated_server(&self) -> Option<Arc<ServerSupervisor>> {
        self.snapshot_one(ServerState::Terminated)
    }

    /// Whether the named server is in any running state right now.
    pub fn is_server_running(&self, name: &str) -> bool {
        self.cell.seal();
        self.cell.is_running(name)
    }

    /// Snapshot of the named server's state.
    pub fn server_state(&self, name: &str) -> Option<ServerState> {
        self.cell.seal();
        self.cell.state_of(name)
    }
}
