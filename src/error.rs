//! Failure taxonomy shared by the digest adapter, the baseline store, and
//! the pipeline stages.
//!
//! Drift is deliberately *not* an error: an upstream digest change is an
//! expected business condition reported as a [`crate::reconcile::Verdict`].
//! Everything here is an actual failure of the invocation in progress.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stages, used to label failures with the stage in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Build,
    Verify,
    Promote,
    Clean,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prepare => "prepare",
            Stage::Build => "build",
            Stage::Verify => "verify",
            Stage::Promote => "promote",
            Stage::Clean => "clean",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// A required external binary could not be invoked at all.
    #[error("{tool} not found in PATH")]
    ToolUnavailable { tool: String },

    /// The registry or its API could not be reached. Digest reconciliation
    /// always treats this as fatal; only informational checks may downgrade
    /// it to a skip-with-warning.
    #[error("network unreachable while {operation}: {detail}")]
    NetworkUnreachable { operation: String, detail: String },

    /// A reference, object, or file that was asked for does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// No baseline has been recorded yet. Expected and recoverable: the
    /// reconciler answers it with an initial sync, not an operator error.
    #[error("no baseline recorded at {}", .0.display())]
    NoBaseline(PathBuf),

    /// Malformed data from an external tool or on-disk artifact.
    #[error("malformed {what}: {detail}")]
    Parse { what: String, detail: String },

    /// The baseline has no digest entry for the requested architecture.
    #[error("no digest recorded for architecture {arch}")]
    MissingArchEntry { arch: String },

    /// A verification sub-check ran and the image failed it.
    #[error("{check} check failed: {detail}")]
    PolicyViolation { check: String, detail: String },

    /// A bounded external operation exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// An external tool launched but exited nonzero for a reason that is
    /// neither a missing object nor a network failure.
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A stage-labelled failure surfaced by the orchestrator.
    #[error("{stage} stage failed")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps an I/O error with a human-readable context line.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Attaches the name of the stage in progress. Already-labelled errors
    /// are returned unchanged so nested orchestration never double-wraps.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            e @ Error::Stage { .. } => e,
            e => Error::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }

    /// The stage label, if this error has been attributed to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
