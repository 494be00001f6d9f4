//! Error types for the solver supervisor

use thiserror::Error;

/// Errors that abort a request or the daemon
///
/// Per-solver failures (missing executable, non-zero exit, garbage
/// output) are deliberately *not* represented here: they are contained
/// in the per-solver [`CommandResult`](crate::CommandResult) with
/// `verdict = error` and never abort sibling solvers. Timeouts and
/// interrupts also produce valid outcomes rather than errors.
#[derive(Debug, Error)]
pub enum JsiError {
    /// The solver definitions file could not be parsed
    #[error("invalid solver definitions: {0}")]
    Config(String),

    /// A `--sequence` entry names a solver the catalogue does not know
    #[error("unknown solver: {0}")]
    UnknownSolver(String),

    /// None of the requested solvers resolved to an executable on PATH
    #[error("no requested solver is available on PATH")]
    NoSolversAvailable,

    /// Another daemon instance owns the socket
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    /// The daemon is at its in-flight request capacity
    #[error("busy")]
    Busy,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}
