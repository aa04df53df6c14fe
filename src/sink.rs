use std::fmt;

use tokio::sync::watch;

/// Why a test failed: a descriptive first-failure message, with the child's
/// exit status when one was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Human-readable reason, e.g. `"Unexpected server crash: …"`.
    pub message: String,
    /// Exit status of the offending child, when the failure came from one.
    pub exit_status: Option<i32>,
}

impl FailureRecord {
    /// Creates a failure record.
    pub fn new<S: Into<String>>(message: S, exit_status: Option<i32>) -> Self {
        Self {
            message: message.into(),
            exit_status,
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Terminal outcome of a harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The test completed every expected lifecycle step.
    Passed,
    /// Something terminated unexpectedly; the record explains what.
    Failed(FailureRecord),
}

impl Verdict {
    /// True for [`Verdict::Passed`].
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }
}

/// Receives the terminal pass/fail verdict. The first call wins; later
/// calls are kept only as log diagnostics. Exit watchers deliver failures
/// here, and every interlock wait observes it so a failed test wakes all
/// blocked callers.
pub struct TestStateSink {
    verdict: watch::Sender<Option<Verdict>>,
}

impl TestStateSink {
    /// Creates a sink with no verdict yet.
    pub fn new() -> Self {
        let (verdict, _) = watch::channel(None);
        Self { verdict }
    }

    /// Records a pass, unless a verdict already exists.
    pub fn test_did_pass(&self) {
        self.record(Verdict::Passed);
    }

    /// Records a failure, unless a verdict already exists.
    pub fn test_did_fail(&self, record: FailureRecord) {
        self.record(Verdict::Failed(record));
    }

    fn record(&self, verdict: Verdict) {
        let mut first = false;
        self.verdict.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(verdict.clone());
                first = true;
                true
            } else {
                false
            }
        });
        if !first {
            // first-wins; the verdict channel already holds the answer
            tracing::debug!(ignored = ?verdict, "late verdict discarded");
        }
    }

    /// Blocks until a verdict has been recorded.
    pub async fn await_verdict(&self) -> Verdict {
        let mut rx = self.verdict.subscribe();
        let seen = rx
            .wait_for(Option::is_some)
            .await
            .expect("verdict sender lives in the sink");
        seen.clone().expect("wait_for only returns a set verdict")
    }

    /// Snapshot of the verdict, if any.
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict.borrow().clone()
    }

    /// The recorded failure, if the verdict is a failure.
    pub(crate) fn failure(&self) -> Option<FailureRecord> {
        match &*self.verdict.borrow() {
            Some(Verdict::Failed(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// Completes once a failure has been recorded. Never completes on a
    /// pass; used by interlock waits to short-circuit.
    pub(crate) async fn failure_signalled(&self) {
        let mut rx = self.verdict.subscribe();
        rx.wait_for(|verdict| matches!(verdict, Some(Verdict::Failed(_))))
            .await
            .expect("verdict sender lives in the sink");
    }
}

impl Default for TestStateSink {
    fn default() -> Self {
        Self::new()
    }
}
