use std::io;

use thiserror::Error;

/// Error produced by the harness surface: supervisor preconditions, control
/// preconditions, configuration mistakes and plumbing failures.
///
/// An unexpected server crash is deliberately *not* a variant here: crashes
/// are reported to the [`TestStateSink`](crate::TestStateSink) as a
/// [`FailureRecord`](crate::FailureRecord), and blocking waits surface them
/// as [`HarnessError::HarnessFailed`].
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A server identity or cluster descriptor was malformed, or the
    /// registry was touched after sealing.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// `start()` was called on a server that has not terminated.
    #[error("server {0} is already running")]
    AlreadyRunning(String),

    /// `stop()` was called on a server that is not running.
    #[error("server {0} is not running")]
    NotRunning(String),

    /// A control operation found the cluster in a state it cannot act on,
    /// e.g. `terminate_active` with no active server.
    #[error("control precondition failed: {0}")]
    Precondition(String),

    /// A blocking wait was short-circuited because the test has already
    /// failed; callers should proceed to orderly shutdown.
    #[error("harness already failed: {0}")]
    HarnessFailed(String),

    /// Stdio, pipe or file-descriptor failure. The harness treats these as
    /// fatal: this environment is low-level and such failures are not
    /// expected mid-test.
    #[error("i/o failure in harness plumbing")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },
}

impl HarnessError {
    /// True when the error is the failure short-circuit rather than a
    /// caller mistake.
    pub fn is_harness_failed(&self) -> bool {
        matches!(self, HarnessError::HarnessFailed(_))
    }
}
