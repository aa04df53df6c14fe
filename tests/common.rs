//! Shared scaffolding for the end-to-end scenarios: a wired-up cluster and
//! stub servers. The stubs are `/bin/sh` scripts that speak the harness's
//! stdout contract (`PID is …`, the role announcements, the ZAP line) and
//! then either park on `sleep` or exit with a scripted status. `exec sleep`
//! keeps the echoed `$$` accurate, so killing the reported PID really kills
//! the stub.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral::{
    testing_event_notifier, EventBufferCollector, ProcessControl, ServerSpec, ServerSupervisor,
    StateInterlock, TestStateSink,
};
use tempfile::TempDir;

/// A stub that comes up as the active node and parks.
pub const ACTIVE_SCRIPT: &str =
    r#"echo "PID is $$"; echo "Server instance has started up as ACTIVE node"; exec sleep 600"#;

/// A stub that comes up as a passive standby and parks.
pub const PASSIVE_SCRIPT: &str =
    r#"echo "PID is $$"; echo "Moved to State[ PASSIVE-STANDBY ]"; exec sleep 600"#;

/// A stub that becomes active and then dies with status 137, unprompted.
pub const CRASH_AFTER_ACTIVE_SCRIPT: &str =
    r#"echo "PID is $$"; echo "Server instance has started up as ACTIVE node"; exit 137"#;

/// A stub that dies before ever reporting a PID.
pub const CRASH_BEFORE_PID_SCRIPT: &str = r#"exit 1"#;

/// A stub that becomes active, announces a ZAP restart, and exits without
/// reporting a fresh PID.
pub const ZAP_THEN_EXIT_SCRIPT: &str = r#"echo "PID is $$"; echo "Server instance has started up as ACTIVE node"; echo "Restarting the server"; exit 0"#;

/// One fully wired harness: sink, interlock, control and the event buffer
/// the scenarios assert against. Working directories live as long as the
/// cluster does.
pub struct TestCluster {
    pub sink: Arc<TestStateSink>,
    pub interlock: Arc<StateInterlock>,
    pub control: Arc<ProcessControl>,
    pub events: EventBufferCollector,
    workdirs: Vec<TempDir>,
    paths: HashMap<String, PathBuf>,
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        let sink = Arc::new(TestStateSink::new());
        let (notifier, events) = testing_event_notifier();
        let interlock = Arc::new(StateInterlock::new(sink.clone(), notifier));
        let control = Arc::new(ProcessControl::new(interlock.clone()));
        Self {
            sink,
            interlock,
            control,
            events,
            workdirs: Vec::new(),
            paths: HashMap::new(),
        }
    }

    /// Registers a stub server running `script` under `/bin/sh -c` in a
    /// fresh working directory.
    pub fn register(&mut self, name: &str, script: &str) -> Arc<ServerSupervisor> {
        let dir = tempfile::tempdir().expect("working directory should be creatable");
        let argv = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
        ];
        let spec = ServerSpec::new(name, dir.path(), move || argv.clone());
        let supervisor = self
            .interlock
            .register(spec)
            .expect("registration should succeed before sealing");
        self.paths.insert(name.to_owned(), dir.path().to_owned());
        self.workdirs.push(dir);
        supervisor
    }

    /// The working directory a server was registered with.
    pub fn workdir(&self, name: &str) -> &Path {
        self.paths
            .get(name)
            .unwrap_or_else(|| panic!("unregistered server: {name}"))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
