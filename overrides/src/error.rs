use std::fmt;

use stubline_intercept::PatchError;
use thiserror::Error;

use crate::quota::Quota;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    #[error("invalid quota {0}: use a positive count, -1 (unlimited) or -2 (always)")]
    InvalidQuota(i64),

    #[error("cannot add {requested} override of `{target}`: it already has a {existing} override")]
    QuotaConflict {
        target: String,
        requested: Quota,
        existing: Quota,
    },

    #[error("{0:#x} is not the entry of a function")]
    NotAFunction(usize),

    #[error("`{0}` is an indirect dispatch stub; override the function it jumps to")]
    DispatchThunk(String),

    #[error("replacement `{0}` captures its environment; only non-capturing closures can be installed")]
    CapturingReplacement(String),

    #[error("replacement at {0:#x} is already in use for another function")]
    SharedReplacement(usize),

    #[error("`{0}` has no override to remove")]
    NotOverridden(String),

    #[error("no override session is open")]
    NoSession,

    #[error("replacement at {replacement:#x} ran but no installed override points at it")]
    OrphanInvocation { replacement: usize },

    #[error("patching failed: {0}")]
    Patch(#[from] PatchError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("an override session is already open in this process")]
    AlreadyOpen,
}

/// A problem noticed while the session ran, reported when it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A fixed-count override was not called as often as requested.
    Deficiency {
        target: String,
        calls: u32,
        expected: u32,
    },
    /// A replacement ran while no installed override pointed at it.
    Orphan { replacement: String },
    /// `Invocation::check_args` saw arguments other than the expected ones.
    ArgumentMismatch {
        target: String,
        run: u32,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Deficiency { target, calls, expected } => {
                write!(f, "function `{}` was called {} of {} time(s)", target, calls, expected)
            }
            Failure::Orphan { replacement } => {
                write!(f, "replacement `{}` was called while not installed", replacement)
            }
            Failure::ArgumentMismatch {
                target,
                run,
                expected,
                actual,
            } => write!(
                f,
                "call #{} of `{}`: expected arguments {}, got {}",
                run, target, expected, actual
            ),
        }
    }
}

/// Everything that went wrong in a session, returned by `Session::finish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectationsNotMet {
    pub failures: Vec<Failure>,
}

impl fmt::Display for ExpectationsNotMet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} expectation(s) not met", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExpectationsNotMet {}

pub type Result<T> = std::result::Result<T, OverrideError>;
