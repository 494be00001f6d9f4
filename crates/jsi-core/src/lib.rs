//! Portfolio runner for SMT solvers
//!
//! jsi races a configured set of external solver binaries on a single
//! SMT-LIB 2 input and reports the answer of the first solver that
//! produces a definitive verdict (`sat` or `unsat`). Its wall-clock time
//! is that of the fastest solver for the given input plus a small
//! supervision overhead.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Supervisor                             │
//! │                                                             │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │  │ bitwuzla │  │   cvc5   │  │  yices   │  │    z3    │ ... │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘  └────┬─────┘     │
//! │       │             │             │             │           │
//! │       └─────────────┴──────┬──────┴─────────────┘           │
//! │                            │                                │
//! │                   first definitive verdict                  │
//! └────────────────────────────┴────────────────────────────────┘
//! ```
//!
//! Each solver runs as a child process in its own process group,
//! supervised by one tokio task. The first `sat`/`unsat` wins the race;
//! the losers are cancelled (TERM, then KILL after a grace period) and
//! reaped before the outcome is returned. The [`server`] module exposes
//! the same semantics over a Unix stream socket for sub-startup-cost
//! request latency.
//!
//! # Example
//!
//! ```ignore
//! use jsi_core::{catalog::Catalog, supervisor, task::Task, SolveOptions};
//!
//! let catalog = Catalog::load(&jsi_core::jsi_home()?)?;
//! let task = std::sync::Arc::new(Task::new());
//! let outcome = supervisor::solve(&input, &SolveOptions::default(), &catalog, task).await?;
//! println!("solved by: {:?}", outcome.winner);
//! ```

pub mod catalog;
pub mod command;
pub mod error;
pub mod output;
pub mod reaper;
pub mod server;
pub mod supervisor;
pub mod task;
pub mod verdict;

use std::env;
use std::path::PathBuf;

pub use catalog::{Catalog, CommandSpec, SolverDefinition};
pub use command::CommandResult;
pub use error::JsiError;
pub use output::write_csv;
pub use server::{Server, ServerConfig};
pub use supervisor::{solve, Outcome, SolveOptions};
pub use task::{CancelReason, Task, TaskStatus};
pub use verdict::Verdict;

/// Location of jsi's persisted state (`$HOME/.jsi`)
///
/// Holds the user solver definitions (`solvers.json`), the PATH-scan
/// cache (`cache.json`) and the daemon runtime files (`daemon/`).
pub fn jsi_home() -> Result<PathBuf, JsiError> {
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".jsi"))
        .ok_or_else(|| JsiError::Internal("HOME is not set".to_string()))
}
