//! Error types for VmHarness

use std::time::Duration;

use thiserror::Error;

/// Result type alias using VmHarness Error
pub type Result<T> = std::result::Result<T, Error>;

/// VmHarness error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed test file: {0}")]
    MalformedTestFile(String),

    #[error("missing required header: {key}")]
    MissingRequiredHeader { key: String },

    #[error("unsupported condition expression: {0}")]
    UnsupportedCondition(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{} postcondition(s) failed: {}", .failures.len(), format_postconditions(.failures))]
    PostconditionFailed { failures: Vec<PostconditionFailure> },

    #[error("timed out after {elapsed:.1?} waiting for {expected:?}")]
    ExpectationTimedOut { expected: String, elapsed: Duration },

    #[error("session closed before {expected:?} appeared")]
    SessionClosed { expected: String },

    #[error("unexpected exit code: expected {expected}, got {actual}")]
    UnexpectedExitCode { expected: i32, actual: i32 },

    #[error("lifecycle transition failed: {operation} on box {box_name}")]
    LifecycleTransitionFailed { box_name: String, operation: String },

    #[error("backend command failed: {0}")]
    Backend(String),
}

/// One failing postcondition, with the value it evaluated to.
#[derive(Debug, Clone)]
pub struct PostconditionFailure {
    pub expression: String,
    pub observed: String,
}

fn format_postconditions(failures: &[PostconditionFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} (was {})", f.expression, f.observed))
        .collect::<Vec<_>>()
        .join("; ")
}
