//! Orphan sweep for a supervisor that died uncleanly
//!
//! An in-process handler cannot clean up after SIGKILL or an OOM kill,
//! so `jsi --supervisor` starts a second process running [`run`] with a
//! pipe from the parent. The parent streams the PID of every solver
//! child it spawns (each leads its own process group) and writes a
//! final [`DONE_MARKER`] line once the request has been drained. If the
//! pipe instead closes without the marker, the parent is gone without
//! having cleaned up: every registered process group is TERMed, then
//! KILLed after the grace period.
//!
//! The pipe doubles as the liveness probe: the kernel closes the write
//! end the instant the parent dies, however it dies, so there is no
//! polling interval to race against.

use crate::command::signal_group;
use std::io::BufRead;
use std::time::Duration;

/// Final line the parent writes after reaping its own children
pub const DONE_MARKER: &str = "done";

/// Window between the TERM and KILL sweeps
const SWEEP_GRACE: Duration = Duration::from_secs(1);

/// Collect process-group ids from the parent until `done` or EOF.
///
/// Returns `None` when the parent signed off with [`DONE_MARKER`]
/// (nothing to do), or the registered groups when the pipe closed
/// without it. Lines that don't parse as PIDs are skipped.
pub fn collect<R: BufRead>(input: R) -> Option<Vec<u32>> {
    let mut pgids = Vec::new();
    for line in input.lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line == DONE_MARKER {
            return None;
        }
        if let Ok(pgid) = line.parse::<u32>() {
            pgids.push(pgid);
        }
    }
    Some(pgids)
}

/// TERM each process group, wait out the grace period, then KILL.
///
/// Groups that already exited are no-ops.
pub fn sweep(pgids: &[u32]) {
    for &pgid in pgids {
        signal_group(pgid, libc::SIGTERM);
    }
    std::thread::sleep(SWEEP_GRACE);
    for &pgid in pgids {
        signal_group(pgid, libc::SIGKILL);
    }
}

/// Watchdog entry point: block on the parent's pipe, sweep on unclean
/// death
pub fn run<R: BufRead>(input: R) {
    if let Some(pgids) = collect(input) {
        sweep(&pgids);
    }
}
