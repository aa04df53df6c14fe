use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use uuid::Uuid;

use crate::config::ServerSpec;
use crate::errors::HarnessError;
use crate::events::EventNotifier;
use crate::interlock::RoleSink;
use crate::sink::{FailureRecord, TestStateSink};
use crate::stream::{EventMap, LogEventStream};

// TODO: replace with OnceCell
lazy_static! {
    static ref PID_LINE: Regex = Regex::new("PID is ([0-9]+)").expect("static pattern compiles");
}

const PID_EVENT: &str = "PID";
const ACTIVE_EVENT: &str = "ACTIVE";
const PASSIVE_EVENT: &str = "PASSIVE";
const ZAP_EVENT: &str = "ZAP";
const WARN_EVENT: &str = "WARN";
const ERROR_EVENT: &str = "ERROR";

fn server_event_map() -> EventMap {
    EventMap::new()
        .on("PID is", PID_EVENT)
        .on("has started up as ACTIVE node", ACTIVE_EVENT)
        .on("Moved to State[ PASSIVE-STANDBY ]", PASSIVE_EVENT)
        .on("Restarting the server", ZAP_EVENT)
        .on("WARN", WARN_EVENT)
        .on("ERROR", ERROR_EVENT)
}

/// Everything about one run of the child, published through a watch channel
/// so the PID rendezvous and stop() races resolve without extra locks.
#[derive(Debug, Clone, Default)]
struct RunState {
    running: bool,
    /// PID of the real server underneath the start script; 0 until the
    /// server reports it (and again after a ZAP forgets it).
    pid: u32,
    /// Set by stop() before the kill so the exit watcher knows this
    /// termination is ours. Monotonic within one run.
    crash_expected: bool,
    /// Diagnostic only; true once the server self-restarted this run.
    was_zapped: bool,
}

/// Serializes start and stop on one supervisor: a single permit, plus a
/// token recorded on entry and verified on exit so the starter is the
/// finisher.
struct UserGate {
    permits: Arc<Semaphore>,
    token: Mutex<Option<Uuid>>,
}

struct GatePass {
    token: Uuid,
    _permit: OwnedSemaphorePermit,
}

impl UserGate {
    fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            token: Mutex::new(None),
        }
    }

    async fn enter(&self) -> GatePass {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("user gate is never closed");
        let token = Uuid::new_v4();
        *self.token.lock().expect("gate token poisoned") = Some(token);
        GatePass {
            token,
            _permit: permit,
        }
    }

    fn exit(&self, pass: GatePass) {
        let current = self.token.lock().expect("gate token poisoned").take();
        assert_eq!(
            current,
            Some(pass.token),
            "gate released by a caller that does not hold it"
        );
    }
}

/// The state the spawned tasks (stdout pump, stderr pump, exit watcher)
/// share with the supervisor handle.
struct ServerShared {
    name: String,
    run: watch::Sender<RunState>,
    interlock: Arc<dyn RoleSink>,
    sink: Arc<TestStateSink>,
    ev_notifier: EventNotifier,
}

impl ServerShared {
    fn describe(&self) -> String {
        format!(
            "Server {} (zapped: {})",
            self.name,
            self.run.borrow().was_zapped
        )
    }

    /// Dispatch target for the log event stream. Runs on the stdout pump.
    fn handle_log_event(&self, event: &str, line: &str) {
        match event {
            PID_EVENT => self.did_report_pid(line),
            ACTIVE_EVENT => self.did_become_active(),
            PASSIVE_EVENT => self.did_become_passive(),
            ZAP_EVENT => self.did_zap(),
            WARN_EVENT => tracing::trace!(server = %self.name, line, "server warning"),
            ERROR_EVENT => tracing::trace!(server = %self.name, line, "server error"),
            other => tracing::debug!(server = %self.name, event = other, "unmapped event"),
        }
    }

    fn did_report_pid(&self, line: &str) {
        let pid = PID_LINE
            .captures(line)
            .and_then(|captures| captures.get(1))
            .and_then(|digits| digits.as_str().parse::<u32>().ok());
        match pid {
            Some(pid) if pid > 0 => {
                self.run.send_modify(|run| run.pid = pid);
                self.ev_notifier.pid_discovered(&self.name, pid);
            }
            _ => {
                // partial match; log it in case something is wrong
                tracing::warn!(server = %self.name, line, "unexpected PID-like line from server");
            }
        }
    }

    fn did_become_active(&self) {
        let pid = self.run.borrow().pid;
        if pid == 0 {
            // stale role line inside a ZAP restart window
            tracing::debug!(server = %self.name, "ignoring role announcement with no PID");
            return;
        }
        self.interlock.server_became_active(&self.name, pid);
        self.ev_notifier.server_active(&self.name);
    }

    fn did_become_passive(&self) {
        let pid = self.run.borrow().pid;
        if pid == 0 {
            tracing::debug!(server = %self.name, "ignoring role announcement with no PID");
            return;
        }
        self.interlock.server_became_passive(&self.name, pid);
        self.ev_notifier.server_passive(&self.name);
    }

    /// A ZAP is an accepted termination-and-restart: the PID is forgotten
    /// and a fresh `PID is` line is required before any reclassification.
    fn did_zap(&self) {
        tracing::info!(server = %self.name, "server restarted due to ZAP");
        self.run.send_modify(|run| {
            run.pid = 0;
            run.was_zapped = true;
        });
        self.interlock.server_was_zapped(&self.name);
        self.ev_notifier.server_zapped(&self.name);
    }

    fn reset_for_start(&self) {
        self.run.send_modify(|run| {
            run.running = true;
            run.pid = 0;
            run.crash_expected = false;
            run.was_zapped = false;
        });
    }

    fn set_crash_expected(&self) {
        self.run.send_modify(|run| run.crash_expected = true);
    }

    /// Resolves to the PID once observed, or 0 once the server has
    /// terminated without ever reporting one.
    async fn wait_for_pid(&self) -> u32 {
        let mut rx = self.run.subscribe();
        let snapshot = rx
            .wait_for(|run| run.pid != 0 || !run.running)
            .await
            .expect("run sender lives in the supervisor");
        snapshot.pid
    }

    /// Terminal step, on the exit watcher, after both pumps drained: by
    /// this point every stdout line (including a late PID) has been
    /// delivered.
    fn did_terminate(&self, status: io::Result<ExitStatus>) {
        let status = match status {
            Ok(status) => {
                tracing::info!(server = %self.name, %status, "server process exited");
                Some(status)
            }
            Err(err) => {
                tracing::error!(server = %self.name, %err, "failed to reap server process");
                None
            }
        };

        let last = self.run.borrow().clone();
        let exit_code = status.as_ref().and_then(ExitStatus::code);
        let failure = if last.crash_expected {
            None
        } else if last.pid == 0 {
            // covers both a crash during startup and an exit after a ZAP
            // that never reported a fresh PID
            Some(FailureRecord::new(
                format!("Server crashed before reporting PID: {}", self.describe()),
                exit_code,
            ))
        } else {
            let shown = match (&status, exit_code) {
                (_, Some(code)) => code.to_string(),
                (Some(status), None) => status.to_string(),
                (None, None) => "unknown".to_owned(),
            };
            Some(FailureRecord::new(
                format!(
                    "Unexpected server crash: {} (PID {}) status: {}",
                    self.describe(),
                    last.pid,
                    shown
                ),
                exit_code,
            ))
        };

        self.run.send_modify(|run| {
            run.running = false;
            run.pid = 0;
            run.crash_expected = false;
        });
        self.interlock.server_did_shutdown(&self.name);
        self.ev_notifier
            .server_terminated(&self.name, last.crash_expected);

        if let Some(record) = failure {
            tracing::error!(server = %self.name, failure = %record, "unexpected server termination");
            self.sink.test_did_fail(record);
        }
    }
}

/// Owns one server child process: launching it with the configured
/// environment, scraping its stdout for lifecycle events, watching its
/// exit, and killing it on request. All state classification is delegated
/// to the interlock through the injected role sink.
pub struct ServerSupervisor {
    spec: ServerSpec,
    /// Read from the environment once at construction, never re-consulted.
    java_home: Option<String>,
    base_java_opts: String,
    gate: UserGate,
    shared: Arc<ServerShared>,
}

impl fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl ServerSupervisor {
    pub(crate) fn new(
        spec: ServerSpec,
        interlock: Arc<dyn RoleSink>,
        sink: Arc<TestStateSink>,
        ev_notifier: EventNotifier,
    ) -> Self {
        let java_home = std::env::var("JAVA_HOME").ok();
        if java_home.is_none() {
            tracing::warn!(server = %spec.name, "JAVA_HOME not set; child will run without it");
        }
        let base_java_opts = std::env::var("JAVA_OPTS").unwrap_or_default();
        let (run, _) = watch::channel(RunState::default());
        Self {
            java_home,
            base_java_opts,
            gate: UserGate::new(),
            shared: Arc::new(ServerShared {
                name: spec.name.clone(),
                run,
                interlock,
                sink,
                ev_notifier,
            }),
            spec,
        }
    }

    /// The cluster-unique server name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether this server ever self-restarted during its current or most
    /// recent run. Diagnostic only.
    pub fn was_zapped(&self) -> bool {
        self.shared.run.borrow().was_zapped
    }

    /// Blocks until the server has reported its PID, or returns 0 if it
    /// terminated first.
    pub async fn wait_for_pid(&self) -> u32 {
        self.shared.wait_for_pid().await
    }

    /// Launches the server in the background. Returns as soon as the child
    /// is spawned: readiness is observed through the interlock as stdout
    /// events arrive. Fails with `AlreadyRunning` unless the server is
    /// terminated, and with `Io` when the working directory is missing.
    pub async fn start(&self) -> Result<(), HarnessError> {
        let pass = self.gate.enter().await;
        let result = self.start_locked().await;
        self.gate.exit(pass);
        result
    }

    async fn start_locked(&self) -> Result<(), HarnessError> {
        if self.shared.interlock.is_running(&self.shared.name) {
            return Err(HarnessError::AlreadyRunning(self.shared.name.clone()));
        }

        // the supplier runs every time so the caller can re-resolve paths
        let argv = (self.spec.command)();
        if argv.is_empty() {
            return Err(HarnessError::ConfigInvalid(format!(
                "server {} produced an empty startup command",
                self.shared.name
            )));
        }

        let stdout_log = self.open_log("stdout.log").await?;
        let stderr_log = self.open_log("stderr.log").await?;

        let java_opts = self.java_opts();
        if self.spec.debug_port > 0 {
            tracing::info!(
                server = %self.shared.name,
                debug_port = self.spec.debug_port,
                "starting server with debug port"
            );
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.spec.working_dir)
            .env("JAVA_OPTS", &java_opts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(java_home) = &self.java_home {
            command.env("JAVA_HOME", java_home);
        }
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        tracing::info!(server = %self.shared.name, command = ?argv, "server process launched");
        self.shared.reset_for_start();
        self.shared.interlock.server_did_startup(&self.shared.name);
        self.shared.ev_notifier.server_started(&self.shared.name);

        let out_pump = tokio::spawn(pump_stdout(self.shared.clone(), stdout, stdout_log));
        let err_pump = tokio::spawn(pump_stderr(self.shared.clone(), stderr, stderr_log));
        tokio::spawn(watch_exit(self.shared.clone(), child, out_pump, err_pump));
        Ok(())
    }

    /// Kills the underlying process and returns once the OS kill command
    /// has completed. The server's own termination is observed
    /// asynchronously by the exit watcher. Fails with `NotRunning` when the
    /// server is terminated; a server that dies while we wait for its PID
    /// makes this a no-op.
    pub async fn stop(&self) -> Result<(), HarnessError> {
        let pass = self.gate.enter().await;
        let result = self.stop_locked().await;
        self.gate.exit(pass);
        result
    }

    async fn stop_locked(&self) -> Result<(), HarnessError> {
        if !self.shared.interlock.is_running(&self.shared.name) {
            return Err(HarnessError::NotRunning(self.shared.name.clone()));
        }
        // can't stop what we can't address: wait for the PID, or for the
        // server to beat us to the grave
        let pid = self.shared.wait_for_pid().await;
        if pid == 0 {
            return Ok(());
        }

        tracing::info!(server = %self.shared.name, pid, "crashing server process");
        self.shared.set_crash_expected();

        let mut kill = kill_command(pid)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // drain the kill's own pipes so it can't wedge on a full buffer
        let kill_stdout = kill.stdout.take();
        let kill_stderr = kill.stderr.take();
        let drain = tokio::spawn(async move {
            if let Some(mut out) = kill_stdout {
                let _ = tokio::io::copy(&mut out, &mut tokio::io::sink()).await;
            }
            if let Some(mut err) = kill_stderr {
                let _ = tokio::io::copy(&mut err, &mut tokio::io::sink()).await;
            }
        });

        loop {
            match time::timeout(Duration::from_secs(5), kill.wait()).await {
                Ok(status) => {
                    let status = status?;
                    // the server may have raced to die, so the code is
                    // logged but never validated
                    tracing::info!(server = %self.shared.name, pid, %status, "kill command exited");
                    break;
                }
                Err(_) => {
                    tracing::info!(server = %self.shared.name, pid, "waiting for server to exit");
                }
            }
        }
        let _ = drain.await;
        Ok(())
    }

    fn java_opts(&self) -> String {
        let mut opts = self.base_java_opts.clone();
        opts.push_str(&format!(" -Xms{0}m -Xmx{0}m", self.spec.heap_mb));
        if self.spec.debug_port > 0 {
            opts.push_str(&format!(
                " -Xdebug -Xrunjdwp:transport=dt_socket,server=y,address={}",
                self.spec.debug_port
            ));
        }
        for (key, value) in &self.spec.properties {
            opts.push_str(&format!(" -D{key}={value}"));
        }
        opts
    }

    async fn open_log(&self, file_name: &str) -> Result<File, HarnessError> {
        let path = self.spec.working_dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(file)
    }
}

impl fmt::Display for ServerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shared.describe())
    }
}

/// Reads child stdout to EOF through the event stream, then flushes and
/// hands the log file back for the exit watcher to close.
async fn pump_stdout(
    shared: Arc<ServerShared>,
    mut stdout: ChildStdout,
    log: File,
) -> io::Result<File> {
    let handler = {
        let shared = shared.clone();
        Box::new(move |event: &str, line: &str| shared.handle_log_event(event, line))
    };
    let mut stream = LogEventStream::new(log, server_event_map(), shared.name.clone(), handler);
    let mut buf = [0u8; 4096];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write(&buf[..n]).await?;
    }
    stream.finish().await
}

/// Stderr carries no lifecycle events; it is only teed to the log file and
/// the harness log.
async fn pump_stderr(
    shared: Arc<ServerShared>,
    mut stderr: ChildStderr,
    log: File,
) -> io::Result<File> {
    let mut stream = LogEventStream::new(
        log,
        EventMap::new(),
        shared.name.clone(),
        Box::new(|_, _| {}),
    );
    let mut buf = [0u8; 4096];
    loop {
        let n = stderr.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write(&buf[..n]).await?;
    }
    stream.finish().await
}

/// Awaits child exit, drains both pumps so every log line has been
/// delivered, closes the log files (the sole closer), then classifies the
/// termination.
async fn watch_exit(
    shared: Arc<ServerShared>,
    mut child: Child,
    out_pump: JoinHandle<io::Result<File>>,
    err_pump: JoinHandle<io::Result<File>>,
) {
    let status = child.wait().await;
    close_log(&shared, out_pump.await);
    close_log(&shared, err_pump.await);
    shared.did_terminate(status);
}

fn close_log(shared: &ServerShared, joined: Result<io::Result<File>, JoinError>) {
    match joined {
        // dropping the file closes it; the pump already flushed
        Ok(Ok(file)) => drop(file),
        Ok(Err(err)) => tracing::warn!(server = %shared.name, %err, "log pump failed"),
        Err(err) => tracing::warn!(server = %shared.name, %err, "log pump panicked"),
    }
}

#[cfg(unix)]
fn kill_command(pid: u32) -> Command {
    let mut command = Command::new("kill");
    command.arg(pid.to_string());
    command
}

#[cfg(windows)]
fn kill_command(pid: u32) -> Command {
    // taskkill tree-kills, since a start script wraps the real server
    let mut command = Command::new("taskkill");
    command.args(["/F", "/t", "/pid"]).arg(pid.to_string());
    command
}
