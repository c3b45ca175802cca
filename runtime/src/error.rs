//! Runtime error types.
//!
//! Two dispositions exist, mirroring the embedding contract: programmer
//! errors (out of memory, impossible channel shapes) abort the process,
//! everything recoverable is reported through [`RuntimeError`].

use core::fmt;

/// Recoverable runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// The scheduler has not been initialized (or was shut down).
    NotInitialized,
    /// The scheduler is already running.
    AlreadyRunning,
    /// A run queue rejected a push because it was full.
    QueueFull,
    /// The legion is not in a state that permits the requested transition.
    InvalidState,
    /// The worker id is outside the configured pool.
    NoSuchWorker,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotInitialized => write!(f, "scheduler not initialized"),
            RuntimeError::AlreadyRunning => write!(f, "scheduler already running"),
            RuntimeError::QueueFull => write!(f, "run queue full"),
            RuntimeError::InvalidState => write!(f, "invalid legion state for operation"),
            RuntimeError::NoSuchWorker => write!(f, "worker id out of range"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Abort the process after logging an unrecoverable programmer error.
///
/// The runtime cannot continue past these (a half-initialized channel or an
/// exhausted address space would only surface as corruption later), so the
/// policy is: one line to stderr, then `abort`.
pub fn fatal(msg: &str) -> ! {
    log::error!("fatal: {msg}");
    eprintln!("infernal-runtime: fatal: {msg}");
    std::process::abort();
}
