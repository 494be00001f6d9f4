//! Shared per-request state machine and cancellation flag
//!
//! A [`Task`] is created by the supervisor for each request and shared
//! with every solver command. It carries the aggregate run status and
//! the cooperative cancellation flag; it never touches processes itself
//! (the commands observe the flag and act on their own children).

use std::fmt;
use tokio::sync::watch;

/// Aggregate status of one request
///
/// Transitions are monotonic: `NotStarted → Running → Terminating →
/// Completed`. Skipping forward is allowed, going back is not, and
/// `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus {
    NotStarted,
    Running,
    Terminating,
    Completed,
}

/// Why a task was cancelled
///
/// Recorded exactly once: the first cancellation wins and later calls
/// are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A solver produced a definitive verdict; stop the losers
    WinnerFound,
    /// The wall-clock budget for the request elapsed
    Timeout,
    /// The user interrupted the run (SIGINT/SIGTERM)
    Interrupted,
    /// The daemon is shutting down
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::WinnerFound => "winner found",
            CancelReason::Timeout => "timeout",
            CancelReason::Interrupted => "interrupted",
            CancelReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Coordination object shared by the supervisor and every command
///
/// Built on watch channels so that observers which subscribe after a
/// transition still see the current value (a broadcast channel would
/// drop flags raised before subscription).
pub struct Task {
    status: watch::Sender<TaskStatus>,
    cancel: watch::Sender<Option<CancelReason>>,
    escalate: watch::Sender<bool>,
    pids: std::sync::Mutex<Vec<u32>>,
}

impl Task {
    pub fn new() -> Self {
        Self {
            status: watch::Sender::new(TaskStatus::NotStarted),
            cancel: watch::Sender::new(None),
            escalate: watch::Sender::new(false),
            pids: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Advance the status, enforcing monotonicity.
    ///
    /// Returns true if the status changed. Attempts to move backwards
    /// are ignored, so concurrent observers may race transitions safely.
    pub fn advance(&self, to: TaskStatus) -> bool {
        self.status.send_if_modified(|current| {
            if to > *current {
                tracing::debug!(from = ?current, ?to, "task status");
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Raise the cancellation flag.
    ///
    /// Transitions `Running → Terminating` exactly once; the first
    /// reason wins and repeated calls are idempotent. Returns true on
    /// the first call.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.cancel.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            tracing::debug!(%reason, "task cancelled");
            self.advance(TaskStatus::Terminating);
        }
        first
    }

    /// The reason the task was cancelled, if it was
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel.borrow()
    }

    /// Skip the TERM grace period: children are killed immediately.
    ///
    /// Used when the user interrupts a second time or the daemon
    /// receives a second SIGTERM.
    pub fn escalate(&self) {
        let _ = self.escalate.send_replace(true);
    }

    /// Wait until the cancellation flag is raised
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.cancel.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender gone; treat as shutdown so waiters unblock.
                return CancelReason::Shutdown;
            }
        }
    }

    /// Wait until termination is escalated to an immediate kill
    pub async fn escalated(&self) {
        let mut rx = self.escalate.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record the PID of a child spawned under this task.
    ///
    /// Each solver child leads its own process group, so these double
    /// as the group ids the parent-death watchdog sweeps.
    pub fn register_pid(&self, pid: u32) {
        self.pids.lock().unwrap().push(pid);
    }

    /// Snapshot of the child PIDs registered so far
    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap().clone()
    }

    /// Wait until the task has started running (or beyond)
    pub async fn wait_started(&self) {
        self.wait_status(TaskStatus::Running).await;
    }

    /// Wait until the task has completed
    pub async fn wait_done(&self) {
        self.wait_status(TaskStatus::Completed).await;
    }

    async fn wait_status(&self, at_least: TaskStatus) {
        let mut rx = self.status.subscribe();
        loop {
            if *rx.borrow_and_update() >= at_least {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status())
            .field("cancel_reason", &self.cancel_reason())
            .finish()
    }
}
