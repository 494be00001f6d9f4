//! Result rendering: CSV export and the stderr summary table
//!
//! Nothing here ever writes to stdout; the verdict line itself comes
//! from [`Outcome::response_text`](crate::Outcome::response_text).

use crate::command::CommandResult;
use std::fs;
use std::path::Path;

pub const CSV_HEADER: &str = "solver,result,exit,time,output file,size";

fn stdout_size(result: &CommandResult) -> u64 {
    fs::metadata(&result.stdout_path)
        .map(|meta| meta.len())
        .unwrap_or(0)
}

/// Render per-solver results as CSV, one row per command
pub fn render_csv(results: &[CommandResult]) -> String {
    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    for result in results {
        csv.push_str(&format!(
            "{},{},{},{:.2}s,{},{}\n",
            result.solver,
            result.verdict,
            result.exit_code,
            result.elapsed().as_secs_f64(),
            result.stdout_path.display(),
            stdout_size(result),
        ));
    }
    csv
}

/// Write the CSV atomically (tmp file, then rename)
pub fn write_csv(path: &Path, results: &[CommandResult]) -> std::io::Result<()> {
    let tmp = path.with_extension("csv.tmp");
    fs::write(&tmp, render_csv(results))?;
    fs::rename(&tmp, path)
}

/// Plain-text summary table for stderr.
///
/// Sorted the way a human scans it: definitive verdicts first, fastest
/// first.
pub fn render_table(results: &[CommandResult]) -> String {
    let mut rows: Vec<&CommandResult> = results.iter().collect();
    rows.sort_by(|a, b| {
        (!a.verdict.is_definitive(), a.elapsed()).cmp(&(!b.verdict.is_definitive(), b.elapsed()))
    });

    let name_width = rows
        .iter()
        .map(|r| r.solver.len())
        .chain(std::iter::once("solver".len()))
        .max()
        .unwrap_or(6);

    let mut table = format!(
        "{:<name_width$}  {:>8}  {:>5}  {:>8}  {}\n",
        "solver", "result", "exit", "time", "output file"
    );
    for row in rows {
        table.push_str(&format!(
            "{:<name_width$}  {:>8}  {:>5}  {:>7.2}s  {}\n",
            row.solver,
            row.verdict.to_string(),
            row.exit_code,
            row.elapsed().as_secs_f64(),
            row.stdout_path.display(),
        ));
    }
    table
}
