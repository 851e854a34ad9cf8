//! VmHarness test runner
//!
//! Drives a fleet of Vagrant boxes through interactive installer sessions,
//! asserting on terminal output:
//! - Parses `.t` test files (headers + session script) into structured cases
//! - Evaluates header directives against a pluggable provisioning backend
//! - Executes session scripts with expect/type/exit-code semantics and
//!   per-line timeout classes
//! - Sequences cases grouped by box to minimize lifecycle churn
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     Runner (orchestrator)                  │
//! │   discover files -> parse -> sort by box -> run each case  │
//! ├──────────────┬──────────────────┬──────────────────────────┤
//! │ testfile     │ directives       │ session                  │
//! │  TestCase    │  destroy-if      │  Session (spawned proc)  │
//! │  ScriptLine  │  pre/post/cleanup│  Interpreter (expect/    │
//! │              │  via condition   │  type/exitcode)          │
//! ├──────────────┴──────────────────┴──────────────────────────┤
//! │ lifecycle: LifecycleManager over the Provider trait        │
//! │ vagrant:   production Provider shelling out to `vagrant`   │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod condition;
pub mod directives;
pub mod lifecycle;
pub mod provider;
pub mod runner;
pub mod session;
pub mod testfile;
pub mod vagrant;

pub use lifecycle::LifecycleManager;
pub use provider::{Provider, ResumeOutcome};
pub use runner::{Runner, RunnerConfig};
pub use vmharness_common::{Error, Result};
