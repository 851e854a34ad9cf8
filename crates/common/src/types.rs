//! Core types for VmHarness

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Box lifecycle state, as recorded by the harness.
///
/// The authoritative state lives in the provisioning backend; this record is
/// an advisory cache used to avoid redundant transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxState {
    Unknown,
    Up,
    Suspended,
    Halted,
    Destroyed,
}

impl Default for BoxState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for BoxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxState::Unknown => write!(f, "unknown"),
            BoxState::Up => write!(f, "up"),
            BoxState::Suspended => write!(f, "suspended"),
            BoxState::Halted => write!(f, "halted"),
            BoxState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Timeout class attached to a script line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutClass {
    /// Output that should appear promptly.
    #[default]
    Normal,
    /// Output gated on slow work (downloads, service startup).
    Slow,
    /// Twice the slow timeout.
    VerySlow,
}

impl TimeoutClass {
    /// Effective timeout for this class given the configured slow base.
    pub fn duration(&self, slow_base: Duration) -> Duration {
        match self {
            TimeoutClass::Normal => Duration::from_secs(2),
            TimeoutClass::Slow => slow_base,
            TimeoutClass::VerySlow => slow_base * 2,
        }
    }
}

/// One line of a test-case session script, parsed at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    /// Start a new interactive session running the command on the case's box.
    Run { command: String },
    /// Expect end-of-stream, then assert the session's exit code.
    ExpectExitCode { preceding: String, code: i32 },
    /// Wait for `expect` to appear, then send `input` as a line of input.
    /// The literal input `gensym` sends a freshly generated token instead.
    Type {
        expect: String,
        input: String,
        timeout: TimeoutClass,
    },
    /// Wait for this exact text to appear in the session output.
    Expect { text: String, timeout: TimeoutClass },
}

/// A header-level directive, one variant per recognized repeatable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Destroy and re-establish the box if the remote shell condition holds.
    DestroyIf(String),
    /// Remote shell condition that must hold on the box before the script runs.
    RemotePrecondition(String),
    /// Local condition expression that must be truthy before the script runs.
    LocalPrecondition(String),
    /// Local condition expression checked after the script completes.
    Postcondition(String),
    /// Local expression run unconditionally for its side effect.
    Cleanup(String),
}

/// A parsed test case. Immutable after construction.
#[derive(Debug, Clone)]
pub struct TestCase {
    /// Name of the box this case runs against.
    pub box_name: String,
    pub title: Option<String>,
    /// All directives in file order.
    pub directives: Vec<Directive>,
    pub script: Vec<ScriptLine>,
}

impl TestCase {
    pub fn destroy_ifs(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::DestroyIf(c) => Some(c.as_str()),
            _ => None,
        })
    }

    pub fn remote_preconditions(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::RemotePrecondition(c) => Some(c.as_str()),
            _ => None,
        })
    }

    pub fn local_preconditions(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::LocalPrecondition(c) => Some(c.as_str()),
            _ => None,
        })
    }

    pub fn postconditions(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Postcondition(c) => Some(c.as_str()),
            _ => None,
        })
    }

    pub fn cleanups(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Cleanup(c) => Some(c.as_str()),
            _ => None,
        })
    }
}

/// Outcome of one scheduled test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed { reason: String },
    /// Not executed because an earlier case failed.
    Skipped,
}

impl CaseOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, CaseOutcome::Passed)
    }
}

/// Result of running a single test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub file: String,
    pub box_name: String,
    pub title: Option<String>,
    #[serde(flatten)]
    pub outcome: CaseOutcome,
    pub duration_ms: u64,
}

/// Result of running all scheduled test cases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<CaseResult>,
}

impl RunSummary {
    /// True iff every scheduled case ran and passed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Captured output of a remote command run over the backend's shell channel.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub code: i32,
    pub output: String,
}
