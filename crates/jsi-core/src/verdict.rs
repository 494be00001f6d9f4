//! Solver verdicts and their classification from raw output

use serde::{Deserialize, Serialize};
use std::fmt;

/// How many bytes of a solver's stdout are inspected for a verdict.
/// Real solvers print the answer on the first line; the rest of the
/// file can be an arbitrarily large model.
pub const CLASSIFY_PREFIX_LEN: usize = 64;

/// The classification of one solver run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Sat,
    Unsat,
    Unknown,
    Error,
}

impl Verdict {
    /// Only definitive verdicts can win the race
    pub fn is_definitive(&self) -> bool {
        matches!(self, Verdict::Sat | Verdict::Unsat)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Sat => "sat",
            Verdict::Unsat => "unsat",
            Verdict::Unknown => "unknown",
            Verdict::Error => "error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a solver's stdout prefix.
///
/// The first whitespace-delimited token decides: `sat`, `unsat` and
/// `unknown` map to their verdicts, empty output is `unknown` (a solver
/// that was killed before printing anything), and any other token is an
/// `error`. Exit codes do not participate here: a solver that prints
/// `sat` and then exits non-zero during cleanup is still `sat`.
pub fn classify_stdout(prefix: &[u8]) -> Verdict {
    let text = String::from_utf8_lossy(prefix);
    match text.split_whitespace().next() {
        None => Verdict::Unknown,
        Some("sat") => Verdict::Sat,
        Some("unsat") => Verdict::Unsat,
        Some("unknown") => Verdict::Unknown,
        Some(_) => Verdict::Error,
    }
}

#[cfg(kani)]
mod kani_proofs {
    use super::*;

    /// Verify only sat and unsat are definitive
    #[kani::proof]
    fn proof_definitive_verdicts() {
        kani::assert(Verdict::Sat.is_definitive(), "sat is definitive");
        kani::assert(Verdict::Unsat.is_definitive(), "unsat is definitive");
        kani::assert(!Verdict::Unknown.is_definitive(), "unknown is not definitive");
        kani::assert(!Verdict::Error.is_definitive(), "error is not definitive");
    }

    /// Verify classification of the canonical solver answers
    #[kani::proof]
    fn proof_classify_canonical() {
        kani::assert(
            classify_stdout(b"sat\n") == Verdict::Sat,
            "sat classifies as sat",
        );
        kani::assert(
            classify_stdout(b"unsat\n") == Verdict::Unsat,
            "unsat classifies as unsat",
        );
        kani::assert(
            classify_stdout(b"") == Verdict::Unknown,
            "empty output classifies as unknown",
        );
    }
}
