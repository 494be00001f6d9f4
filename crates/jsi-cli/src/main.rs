//! jsi command-line interface
//!
//! One-shot mode races the configured solvers on a single input file
//! and prints the winning verdict on stdout; `--daemon` detaches a
//! long-lived server answering the same requests over a Unix socket.

use anyhow::{Context, Result};
use clap::Parser;
use jsi_core::server::{probe, DaemonPaths, Server, ServerConfig};
use jsi_core::task::CancelReason;
use jsi_core::{jsi_home, output, supervisor, Outcome, SolveOptions, Task, Verdict};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const LOG_ENV: &str = "JSI_LOG";

#[derive(Debug, Parser)]
#[command(name = "jsi", version, about = "Run SMT solvers in parallel and report the first definitive answer", long_about = None)]
struct Cli {
    /// SMT-LIB 2 input file
    input: Option<PathBuf>,

    /// Run only these solvers, in the given order (comma-separated)
    #[arg(long, value_delimiter = ',')]
    sequence: Option<Vec<String>>,

    /// Wall-clock budget for the whole request, in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Delay between consecutive solver starts, in seconds
    #[arg(long, default_value_t = 0.0)]
    interval: f64,

    /// Run every solver to completion instead of stopping at the first answer
    #[arg(long)]
    full_run: bool,

    /// Ask solvers to produce a model for satisfiable instances
    #[arg(long)]
    model: bool,

    /// Write per-solver results as CSV next to the input
    #[arg(long)]
    csv: bool,

    /// Directory for solver output files (defaults to the input's directory)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Run a watchdog process that reaps solvers if jsi dies uncleanly
    #[arg(long)]
    supervisor: bool,

    /// Start the daemon instead of solving a file
    #[arg(long)]
    daemon: bool,

    /// Internal: run the daemon accept loop in this process
    #[arg(long, hide = true)]
    daemon_worker: bool,

    /// Internal: run the orphan-reaper watchdog in this process
    #[arg(long, hide = true)]
    reaper_worker: bool,
}

impl Cli {
    fn solve_options(&self) -> SolveOptions {
        SolveOptions {
            sequence: self.sequence.clone(),
            timeout: self.timeout.map(Duration::from_secs_f64),
            interval: Duration::from_secs_f64(self.interval),
            model: self.model,
            full_run: self.full_run,
            csv: self.csv,
            output_dir: self.output_dir.clone(),
        }
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = if cli.reaper_worker {
        run_reaper_worker()
    } else if cli.daemon_worker {
        run_daemon_worker().await
    } else if cli.daemon {
        start_daemon()
    } else {
        Ok(run_one_shot(&cli).await)
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run_one_shot(cli: &Cli) -> ExitCode {
    let (input, catalog) = match preflight(cli) {
        Ok(prepared) => prepared,
        Err(err) => return request_failed(&err),
    };

    let task = Arc::new(Task::new());
    spawn_interrupt_watcher(task.clone());

    let reaper = if cli.supervisor {
        match spawn_reaper(task.clone()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(%err, "failed to start the watchdog process");
                None
            }
        }
    } else {
        None
    };

    let solved = supervisor::solve(&input, &cli.solve_options(), &catalog, task.clone()).await;
    if let Some(handle) = reaper {
        handle.finish().await;
    }

    let outcome = match solved {
        Ok(outcome) => outcome,
        Err(err) => return request_failed(&err.into()),
    };

    eprintln!();
    eprint!("{}", output::render_table(&outcome.results));

    // the only bytes that ever reach stdout
    print!("{}", outcome.response_text());

    let interrupted = task.cancel_reason() == Some(CancelReason::Interrupted);
    ExitCode::from(exit_code_for(&outcome, interrupted))
}

/// Everything that must hold before anything is spawned
fn preflight(cli: &Cli) -> Result<(PathBuf, jsi_core::Catalog)> {
    let input = cli.input.clone().context("no input file provided")?;
    if !input.is_file() {
        anyhow::bail!("input file does not exist: {}", input.display());
    }
    if let Some(dir) = &cli.output_dir {
        if !dir.is_dir() {
            anyhow::bail!("output directory does not exist: {}", dir.display());
        }
    }

    let home = jsi_home()?;
    let catalog = jsi_core::Catalog::load(&home)?;
    Ok((input, catalog))
}

/// A request that never produced an outcome still owes stdout its
/// verdict line; the diagnostic detail goes to stderr.
fn request_failed(err: &anyhow::Error) -> ExitCode {
    eprintln!("error: {err:#}");
    println!("error");
    ExitCode::from(2)
}

fn exit_code_for(outcome: &Outcome, interrupted: bool) -> u8 {
    if interrupted {
        return 130;
    }
    match outcome.verdict {
        Verdict::Sat | Verdict::Unsat => 0,
        Verdict::Unknown => 1,
        Verdict::Error => 2,
    }
}

/// First interrupt cancels the race; a second one skips the TERM grace
/// period. The supervisor still reaps every child before returning.
fn spawn_interrupt_watcher(task: Arc<Task>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut interrupts = 0u32;
        loop {
            tokio::select! {
                ctrl_c = tokio::signal::ctrl_c() => {
                    if ctrl_c.is_err() {
                        return;
                    }
                }
                _ = async {
                    match sigterm.as_mut() {
                        Some(stream) => { stream.recv().await; }
                        None => std::future::pending().await,
                    }
                } => {}
            }
            interrupts += 1;
            if interrupts == 1 {
                warn!("interrupted, stopping solvers");
                task.cancel(CancelReason::Interrupted);
            } else {
                warn!("second interrupt, killing solvers immediately");
                task.escalate();
            }
        }
    });
}

/// The parent half of the orphan watchdog.
///
/// Streams solver PIDs to the reaper process as they appear and signs
/// off with the done marker once the request has been drained. If this
/// process dies before the sign-off, the pipe closes and the reaper
/// sweeps the groups; see [`jsi_core::reaper`].
struct ReaperHandle {
    stop: tokio::sync::oneshot::Sender<()>,
    forwarder: tokio::task::JoinHandle<()>,
}

impl ReaperHandle {
    async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.forwarder.await;
    }
}

fn spawn_reaper(task: Arc<Task>) -> Result<ReaperHandle> {
    use std::io::Write;
    use std::process::Stdio;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--reaper-worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        // its own group, so terminal signals aimed at us leave it alive
        // long enough to do its job
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().context("failed to start the watchdog process")?;
    let mut stdin = child
        .stdin
        .take()
        .context("watchdog process has no stdin")?;

    let (stop, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    let forwarder = tokio::spawn(async move {
        let mut sent = 0;
        loop {
            let pids = task.pids();
            for pid in &pids[sent..] {
                let _ = writeln!(stdin, "{pid}");
            }
            sent = pids.len();
            let _ = stdin.flush();
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        // late stragglers, then release the watchdog
        let pids = task.pids();
        for pid in &pids[sent..] {
            let _ = writeln!(stdin, "{pid}");
        }
        let _ = writeln!(stdin, "{}", jsi_core::reaper::DONE_MARKER);
        let _ = stdin.flush();
    });

    Ok(ReaperHandle { stop, forwarder })
}

fn run_reaper_worker() -> Result<ExitCode> {
    let stdin = std::io::stdin();
    jsi_core::reaper::run(stdin.lock());
    Ok(ExitCode::SUCCESS)
}

/// Fork the daemon off as a detached child with stdio redirected to the
/// server log files, then return immediately.
fn start_daemon() -> Result<ExitCode> {
    use std::process::Stdio;

    let home = jsi_home()?;
    let paths = DaemonPaths::new(&home);
    if let Some(pid) = probe(&paths) {
        anyhow::bail!("daemon already running (pid {pid})");
    }

    std::fs::create_dir_all(&paths.root)?;
    let stdout = std::fs::File::create(&paths.stdout)?;
    let stderr = std::fs::File::create(&paths.stderr)?;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon-worker")
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().context("failed to start daemon")?;
    eprintln!(
        "daemon started (pid {}), logs in {}",
        child.id(),
        paths.root.display()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_daemon_worker() -> Result<ExitCode> {
    let home = jsi_home()?;
    let server = Server::new(ServerConfig::new(home))?;
    server.run().await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sequence_is_comma_separated() {
        let cli = Cli::parse_from(["jsi", "--sequence", "yices,z3", "file.smt2"]);
        assert_eq!(
            cli.sequence,
            Some(vec!["yices".to_string(), "z3".to_string()])
        );
        assert_eq!(cli.input, Some(PathBuf::from("file.smt2")));
    }

    #[test]
    fn timeout_is_fractional_seconds() {
        let cli = Cli::parse_from(["jsi", "--timeout", "2.5", "file.smt2"]);
        let options = cli.solve_options();
        assert_eq!(options.timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["jsi", "file.smt2"]);
        let options = cli.solve_options();
        assert!(options.sequence.is_none());
        assert!(options.timeout.is_none());
        assert!(options.interval.is_zero());
        assert!(!options.full_run);
        assert!(!options.model);
        assert!(!options.csv);
        assert!(!cli.supervisor);
    }

    #[test]
    fn supervisor_flag_parses() {
        let cli = Cli::parse_from(["jsi", "--supervisor", "file.smt2"]);
        assert!(cli.supervisor);
    }

    #[test]
    fn exit_codes_follow_the_verdict() {
        let outcome = |verdict| Outcome {
            winner: None,
            verdict,
            elapsed: Duration::ZERO,
            results: vec![],
            disagreement: false,
        };
        assert_eq!(exit_code_for(&outcome(Verdict::Sat), false), 0);
        assert_eq!(exit_code_for(&outcome(Verdict::Unsat), false), 0);
        assert_eq!(exit_code_for(&outcome(Verdict::Unknown), false), 1);
        assert_eq!(exit_code_for(&outcome(Verdict::Error), false), 2);
        assert_eq!(exit_code_for(&outcome(Verdict::Unknown), true), 130);
    }
}
