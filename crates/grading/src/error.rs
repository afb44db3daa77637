//! Error types for plan building and phase execution.
//!
//! Every error maps to a [`FailureKind`], which is what the grade report
//! records. Kinds decide how far a failure reaches: configuration and
//! resolution errors stop the run before any machine is touched, the rest
//! abort only the phase they happen in.

use labspec::{Phase, SpecError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Categories of grading failures, as recorded in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The lab spec is invalid
    Configuration,
    /// A bound variable has no usable value in some phase
    Resolution,
    /// The student's automation failed outside the failure policy
    Converge,
    /// An operation ran past its deadline
    Timeout,
    /// A host could not be reached (converge or reboot)
    Unreachable,
    /// State collection on a host failed
    Snapshot,
    /// The verification runner could not run its probes
    Verification,
    /// The run was cancelled or its environment broke underneath it
    Aborted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Resolution => "resolution",
            Self::Converge => "converge",
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::Snapshot => "snapshot",
            Self::Verification => "verification",
            Self::Aborted => "aborted",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Configuration => "Invalid lab specification",
            Self::Resolution => "Variable could not be resolved",
            Self::Converge => "Playbook run failed",
            Self::Timeout => "Operation timed out",
            Self::Unreachable => "Host unreachable",
            Self::Snapshot => "State collection failed",
            Self::Verification => "Verification could not run",
            Self::Aborted => "Run aborted",
        }
    }

    /// Actionable advice for resolving this kind of failure.
    pub fn advice(self) -> &'static str {
        match self {
            Self::Configuration => "Fix the reported fields in the lab spec and run `hammer validate`",
            Self::Resolution => {
                "Give the variable a non-null default or set it in every phase overlay that checks it"
            }
            Self::Converge => "Inspect the converge log for the first failed task",
            Self::Timeout => "Raise the timeout in the grader config or look for a hanging task",
            Self::Unreachable => "Check that the lab machines are running and reachable over SSH",
            Self::Snapshot => "Check SSH access and that the probe commands exist on the host",
            Self::Verification => "Check SSH access from the grading host and the probe tools",
            Self::Aborted => "Re-run the grader; check the run directory if the problem persists",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while building a plan or running a phase.
#[derive(Debug, Error)]
pub enum GradeError {
    /// The lab spec failed to load or validate
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// Configuration problem detected outside spec validation
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A bound value could not be resolved for a phase
    #[error("cannot resolve '{variable}' in {phase}: {message}")]
    Resolution {
        variable: String,
        phase: Phase,
        message: String,
    },

    /// The automation run failed
    #[error("converge failed: {message}")]
    Converge { message: String },

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// A host could not be reached
    #[error("host {host} unreachable: {message}")]
    Unreachable { host: String, message: String },

    /// Snapshot collection failed
    #[error("snapshot of {host} failed: {message}")]
    Snapshot { host: String, message: String },

    /// Verification probes could not run
    #[error("verification on {host} failed: {message}")]
    Verification { host: String, message: String },

    /// IO failure while preparing converge inputs
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Plan or report could not be serialized
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Cancelled by the operator
    #[error("cancelled")]
    Cancelled,
}

impl GradeError {
    /// The report category of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Spec(_) | Self::Configuration(_) => FailureKind::Configuration,
            Self::Resolution { .. } => FailureKind::Resolution,
            Self::Converge { .. } => FailureKind::Converge,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Unreachable { .. } => FailureKind::Unreachable,
            Self::Snapshot { .. } => FailureKind::Snapshot,
            Self::Verification { .. } => FailureKind::Verification,
            Self::Io { .. } | Self::Json(_) | Self::Cancelled => FailureKind::Aborted,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type for grading operations.
pub type Result<T> = std::result::Result<T, GradeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_and_converge_are_distinct() {
        let timeout = GradeError::Timeout {
            operation: "converge".into(),
            seconds: 600,
        };
        let converge = GradeError::Converge {
            message: "exit 2".into(),
        };
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(converge.kind(), FailureKind::Converge);
        assert_eq!(timeout.to_string(), "converge timed out after 600s");
    }

    #[test]
    fn test_cancelled_is_aborted() {
        assert_eq!(GradeError::Cancelled.kind(), FailureKind::Aborted);
        assert!(!FailureKind::Aborted.advice().is_empty());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::Unreachable).unwrap();
        assert_eq!(json, "\"unreachable\"");
    }
}
