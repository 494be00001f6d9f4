//! Race coordinator: spawns one command per solver and resolves the winner
//!
//! All commands run under a common [`Task`]. Completions arrive over a
//! channel in arrival order (spawn order breaks ties between commands
//! that finish in the same scheduler tick); the first definitive result
//! claims the winner slot, the remaining solvers are cancelled and
//! their results are still collected and recorded.

use crate::catalog::Catalog;
use crate::command::{self, CommandResult};
use crate::error::JsiError;
use crate::task::{CancelReason, Task, TaskStatus};
use crate::verdict::Verdict;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Options for one request
#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    /// Run only these solvers, in the given order
    pub sequence: Option<Vec<String>>,
    /// Wall-clock budget measured from the first spawn
    pub timeout: Option<Duration>,
    /// Delay between consecutive solver starts
    pub interval: Duration,
    /// Ask solvers to produce a model for satisfiable instances
    pub model: bool,
    /// Run every solver to completion instead of cancelling losers
    pub full_run: bool,
    /// Write per-solver results as CSV next to the input
    pub csv: bool,
    /// Where solver output files go; defaults to the input's directory
    pub output_dir: Option<PathBuf>,
}

/// The synthesised result of one request
#[derive(Debug)]
pub struct Outcome {
    /// Solver that produced the first definitive verdict, if any
    pub winner: Option<String>,
    pub verdict: Verdict,
    pub elapsed: Duration,
    /// One result per resolved solver, in spawn order
    pub results: Vec<CommandResult>,
    /// Two solvers produced conflicting definitive verdicts
    pub disagreement: bool,
}

impl Outcome {
    /// The stdout contract: one verdict line, and for a won race a
    /// comment line naming the winning solver
    pub fn response_text(&self) -> String {
        match &self.winner {
            Some(winner) => format!("{}\n; (result from {})\n", self.verdict, winner),
            None => format!("{}\n", self.verdict),
        }
    }
}

/// Race the catalogue's solvers on one input file.
///
/// Solver-level failures are contained in the per-solver results;
/// this returns an error only for configuration and resolution
/// problems, before anything is spawned. Cancellation (winner found,
/// timeout, interrupt, shutdown) always drains every spawned command
/// before the outcome is returned, so no child survives the call.
pub async fn solve(
    input: &Path,
    options: &SolveOptions,
    catalog: &Catalog,
    task: Arc<Task>,
) -> Result<Outcome, JsiError> {
    let output_dir = options
        .output_dir
        .clone()
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let specs = catalog.resolve(
        options.sequence.as_deref(),
        input,
        &output_dir,
        options.model,
    )?;

    info!(
        input = %input.display(),
        solvers = specs.len(),
        "starting race"
    );

    let started = Instant::now();
    let deadline = options.timeout.map(|budget| started + budget);
    task.advance(TaskStatus::Running);

    // watchdog raises the task-level timeout flag; commands also watch
    // the deadline themselves, so this is the ordering guarantee
    // (cancel happens-before the termination signals), not the enforcer
    let watchdog = deadline.map(|at| {
        let task = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if task.cancel(CancelReason::Timeout) {
                warn!("request timed out");
            }
        })
    });

    let (tx, mut rx) = mpsc::channel::<(usize, CommandResult)>(specs.len().max(1));
    let mut workers = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().cloned().enumerate() {
        let tx = tx.clone();
        let task = task.clone();
        let stagger = options.interval * index as u32;
        workers.push(tokio::spawn(async move {
            if !stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(stagger) => {}
                    _ = task.cancelled() => {}
                }
            }
            // no spawns once the task is terminating
            let result = if task.cancel_reason().is_some() {
                CommandResult::skipped(&spec)
            } else {
                command::run(&spec, &task, deadline).await
            };
            let _ = tx.send((index, result)).await;
        }));
    }
    drop(tx);

    let mut slots: Vec<Option<CommandResult>> = (0..specs.len()).map(|_| None).collect();
    let mut winner: Option<(String, Verdict)> = None;
    let mut disagreement = false;

    while let Some((index, result)) = rx.recv().await {
        if result.verdict.is_definitive() && !result.cancelled {
            match &winner {
                None => {
                    debug!(solver = %result.solver, verdict = %result.verdict, "winner");
                    winner = Some((result.solver.clone(), result.verdict));
                    if !options.full_run {
                        task.cancel(CancelReason::WinnerFound);
                    }
                }
                Some((first, verdict)) if *verdict != result.verdict => {
                    // a miscompiled solver; the first commit stands
                    warn!(
                        winner = %first,
                        dissenter = %result.solver,
                        "solvers disagree on the verdict"
                    );
                    disagreement = true;
                }
                Some(_) => {}
            }
        }
        slots[index] = Some(result);
    }

    for worker in workers {
        let _ = worker.await;
    }
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    task.advance(TaskStatus::Terminating);
    task.advance(TaskStatus::Completed);

    let results: Vec<CommandResult> = slots.into_iter().flatten().collect();
    let verdict = match &winner {
        Some((_, verdict)) => *verdict,
        None if results.iter().all(|r| r.verdict == Verdict::Error) => Verdict::Error,
        None => Verdict::Unknown,
    };

    let outcome = Outcome {
        winner: winner.map(|(name, _)| name),
        verdict,
        elapsed: started.elapsed(),
        results,
        disagreement,
    };

    if options.csv {
        let basename = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let csv_path = output_dir.join(format!("{basename}.csv"));
        if let Err(err) = crate::output::write_csv(&csv_path, &outcome.results) {
            warn!(%err, "failed to write CSV results");
        } else {
            info!(path = %csv_path.display(), "wrote CSV results");
        }
    }

    info!(
        verdict = %outcome.verdict,
        winner = outcome.winner.as_deref().unwrap_or("-"),
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "race finished"
    );
    Ok(outcome)
}
