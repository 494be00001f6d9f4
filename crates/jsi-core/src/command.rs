//! One supervised solver child process
//!
//! [`run`] launches a single solver, redirects its stdout to the
//! per-solver output file, watches for child exit, task cancellation
//! and the global deadline, and classifies the verdict once the child
//! has been reaped. Termination is delivered to the child's process
//! group (TERM, then KILL after a grace period) so transitively spawned
//! helpers cannot outlive the run.

use crate::catalog::CommandSpec;
use crate::task::Task;
use crate::verdict::{classify_stdout, Verdict, CLASSIFY_PREFIX_LEN};
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// Stderr is kept in memory, bounded; anything beyond this is dropped
pub const STDERR_CAP: usize = 64 * 1024;

/// Window between SIGTERM and SIGKILL
pub const TERM_GRACE: Duration = Duration::from_secs(1);

/// Exit code recorded when the solver never produced one (spawn
/// failure, never started)
pub const NO_EXIT_CODE: i32 = -1;

/// The immutable record of one solver run
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub solver: String,
    pub verdict: Verdict,
    pub exit_code: i32,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub stdout_path: PathBuf,
    /// First [`STDERR_CAP`] bytes of the solver's stderr
    pub stderr: Vec<u8>,
    /// True iff termination was initiated by the supervisor for any
    /// reason other than natural exit
    pub cancelled: bool,
}

impl CommandResult {
    pub fn elapsed(&self) -> Duration {
        self.ended_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }

    /// Record for a solver that was cancelled before it ever spawned
    pub(crate) fn skipped(spec: &CommandSpec) -> Self {
        let now = SystemTime::now();
        Self {
            solver: spec.name.clone(),
            verdict: Verdict::Unknown,
            exit_code: NO_EXIT_CODE,
            started_at: now,
            ended_at: now,
            stdout_path: spec.stdout_path.clone(),
            stderr: Vec::new(),
            cancelled: true,
        }
    }
}

/// Run one solver to completion.
///
/// Guarantees on every exit path: the child (if any) has been reaped,
/// its stdout file is closed, and the process group it anchored has
/// been signalled if termination was requested.
pub async fn run(spec: &CommandSpec, task: &Task, deadline: Option<Instant>) -> CommandResult {
    let started_at = SystemTime::now();
    let started = Instant::now();

    if let Some(mode) = spec.virtual_mode {
        return run_virtual(spec, mode, started_at);
    }

    let stdout_file = match std::fs::File::create(&spec.stdout_path) {
        Ok(file) => file,
        Err(err) => {
            warn!(solver = %spec.name, %err, "cannot create output file");
            return error_result(spec, started_at, started);
        }
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(target_os = "linux")]
    {
        // the fresh process group detaches the child from our fate, so
        // ask the kernel to TERM it if we die without cleaning up
        let parent = std::process::id();
        unsafe {
            cmd.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                // the parent may have died before prctl took effect
                if libc::getppid() as u32 != parent {
                    libc::raise(libc::SIGTERM);
                }
                Ok(())
            });
        }
    }

    debug!(solver = %spec.name, program = %spec.program.display(), "starting");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(solver = %spec.name, %err, "failed to spawn");
            return error_result(spec, started_at, started);
        }
    };
    if let Some(pid) = child.id() {
        task.register_pid(pid);
    }

    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(read_capped(pipe, STDERR_CAP)));

    let deadline_elapsed = async {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    };

    let mut cancelled = false;
    let status = tokio::select! {
        // prefer natural exit when several branches are ready at once
        biased;
        status = child.wait() => status,
        reason = task.cancelled() => {
            debug!(solver = %spec.name, %reason, "terminating");
            cancelled = true;
            terminate(&mut child, task).await
        }
        _ = deadline_elapsed => {
            debug!(solver = %spec.name, "deadline elapsed, terminating");
            cancelled = true;
            terminate(&mut child, task).await
        }
    };

    let stderr = match stderr_task {
        Some(handle) => match timeout(TERM_GRACE, handle).await {
            Ok(Ok(bytes)) => bytes,
            _ => Vec::new(),
        },
        None => Vec::new(),
    };

    let ended_at = started_at + started.elapsed();
    let exit_code = match status {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            warn!(solver = %spec.name, %err, "wait failed");
            NO_EXIT_CODE
        }
    };

    let verdict = classify(spec, exit_code, cancelled);
    if !cancelled {
        debug!(solver = %spec.name, %verdict, exit_code, "finished");
    }

    CommandResult {
        solver: spec.name.clone(),
        verdict,
        exit_code,
        started_at,
        ended_at,
        stdout_path: spec.stdout_path.clone(),
        stderr,
        cancelled,
    }
}

/// TERM the process group, wait out the grace period, then KILL.
///
/// An escalated task skips the grace period. The child is always
/// reaped before returning.
async fn terminate(child: &mut Child, task: &Task) -> std::io::Result<std::process::ExitStatus> {
    let pid = child.id();
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }

    let grace = async {
        tokio::select! {
            _ = sleep(TERM_GRACE) => {}
            _ = task.escalated() => {}
        }
    };

    tokio::select! {
        status = child.wait() => status,
        _ = grace => {
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            child.wait().await
        }
    }
}

/// Deliver a signal to the whole process group led by `pgid`.
///
/// Negative pid addresses the process group; errors (group already
/// gone) are ignored.
pub(crate) fn signal_group(pgid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signal);
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| -status.signal().unwrap_or(1))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(NO_EXIT_CODE)
    }
}

/// A virtual solver writes its fixed verdict and "exits" 0 without
/// spawning anything
fn run_virtual(
    spec: &CommandSpec,
    mode: crate::catalog::VirtualMode,
    started_at: SystemTime,
) -> CommandResult {
    let verdict = mode.verdict();
    let (verdict, exit_code) = match std::fs::write(&spec.stdout_path, format!("{verdict}\n")) {
        Ok(()) => (verdict, 0),
        Err(err) => {
            warn!(solver = %spec.name, %err, "cannot write output file");
            (Verdict::Error, NO_EXIT_CODE)
        }
    };
    CommandResult {
        solver: spec.name.clone(),
        verdict,
        exit_code,
        started_at,
        ended_at: SystemTime::now(),
        stdout_path: spec.stdout_path.clone(),
        stderr: Vec::new(),
        cancelled: false,
    }
}

fn error_result(spec: &CommandSpec, started_at: SystemTime, started: Instant) -> CommandResult {
    CommandResult {
        solver: spec.name.clone(),
        verdict: Verdict::Error,
        exit_code: NO_EXIT_CODE,
        started_at,
        ended_at: started_at + started.elapsed(),
        stdout_path: spec.stdout_path.clone(),
        stderr: Vec::new(),
        cancelled: false,
    }
}

/// Read at most `cap` bytes, then keep draining so the child never
/// blocks on a full pipe
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut pipe: R, cap: usize) -> Vec<u8> {
    let mut buf = vec![0u8; cap];
    let mut filled = 0;
    loop {
        match pipe.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == cap {
                    let mut sink = [0u8; 4096];
                    while matches!(pipe.read(&mut sink).await, Ok(n) if n > 0) {}
                    break;
                }
            }
            Err(_) => break,
        }
    }
    buf.truncate(filled);
    buf
}

/// Classify the run from the exit code and the stdout prefix.
///
/// The definition's `verdict_map` takes precedence for matching exit
/// codes. Otherwise the stdout prefix decides; stdout wins over a
/// non-zero exit code (real solvers print the answer before failing
/// cleanup), but a naturally failed run with *blank* stdout is an
/// error. Cancelled runs with blank stdout stay `unknown`.
fn classify(spec: &CommandSpec, exit_code: i32, cancelled: bool) -> Verdict {
    if let Some(map) = &spec.verdict_map {
        if let Some(verdict) = map.get(&exit_code.to_string()) {
            return *verdict;
        }
    }

    let prefix = read_stdout_prefix(&spec.stdout_path);
    let blank = String::from_utf8_lossy(&prefix)
        .split_whitespace()
        .next()
        .is_none();
    match classify_stdout(&prefix) {
        Verdict::Unknown if blank && exit_code != 0 && !cancelled => Verdict::Error,
        verdict => verdict,
    }
}

fn read_stdout_prefix(path: &std::path::Path) -> Vec<u8> {
    let mut buf = vec![0u8; CLASSIFY_PREFIX_LEN];
    let mut filled = 0;
    if let Ok(mut file) = std::fs::File::open(path) {
        loop {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled == buf.len() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
    buf.truncate(filled);
    buf
}
