//! Provisioning backend abstraction
//!
//! The harness treats the VM backend as an opaque lifecycle provider
//! reachable by named commands, plus a remote-shell channel. The production
//! implementation shells out to `vagrant` (see [`crate::vagrant`]); tests
//! substitute a recording fake.

use async_trait::async_trait;
use vmharness_common::{RemoteOutput, Result};

use crate::session::Session;

/// Outcome of a `resume` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The box is up again.
    Resumed,
    /// The backend reported there is nothing to resume (box not created
    /// or not suspended); a full `up` is required.
    NeedsUp,
}

/// Named lifecycle commands and the remote-shell channel of the backend.
///
/// All operations target a box by name and are strictly sequential from the
/// caller's perspective.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn resume(&self, box_name: &str) -> Result<ResumeOutcome>;

    async fn up(&self, box_name: &str) -> Result<()>;

    async fn suspend(&self, box_name: &str) -> Result<()>;

    async fn halt(&self, box_name: &str) -> Result<()>;

    /// Irrecoverable; used only by the destroy-if directive.
    async fn destroy(&self, box_name: &str) -> Result<()>;

    /// Sync the latest installer bits onto the box.
    async fn rsync(&self, box_name: &str) -> Result<()>;

    /// Run a shell command on the box to completion, capturing its exit code
    /// and output.
    async fn run_remote(&self, box_name: &str, command: &str) -> Result<RemoteOutput>;

    /// Spawn an interactive session running `command` on the box.
    async fn open_session(&self, box_name: &str, command: &str) -> Result<Session>;
}

/// Recording fake backend used by the harness's own tests.
pub mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::process::Command;
    use vmharness_common::{Error, RemoteOutput, Result};

    use super::{Provider, ResumeOutcome};
    use crate::session::Session;

    /// One recorded lifecycle transition, in call order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Transition {
        Resume(String),
        Up(String),
        Suspend(String),
        Halt(String),
        Destroy(String),
        Rsync(String),
    }

    /// Records every lifecycle call and remote command. Sessions run under a
    /// local shell so scripts execute for real.
    #[derive(Default)]
    pub struct FakeProvider {
        transitions: Mutex<Vec<Transition>>,
        remote_commands: Mutex<Vec<(String, String)>>,
        needs_up: HashSet<String>,
        fail_resume: HashSet<String>,
        fail_up: HashSet<String>,
        remote_exit_codes: HashMap<String, i32>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `resume` report that this box has no checkpoint.
        pub fn needs_up(mut self, box_name: &str) -> Self {
            self.needs_up.insert(box_name.to_string());
            self
        }

        /// Make `resume` fail outright for this box.
        pub fn fail_resume(mut self, box_name: &str) -> Self {
            self.fail_resume.insert(box_name.to_string());
            self
        }

        /// Make `up` fail for this box.
        pub fn fail_up(mut self, box_name: &str) -> Self {
            self.fail_up.insert(box_name.to_string());
            self
        }

        /// Exit code reported for remote commands containing `fragment`
        /// (default 0).
        pub fn with_remote_exit(mut self, fragment: &str, code: i32) -> Self {
            self.remote_exit_codes.insert(fragment.to_string(), code);
            self
        }

        pub fn transitions(&self) -> Vec<Transition> {
            self.transitions.lock().unwrap().clone()
        }

        pub fn remote_commands(&self) -> Vec<(String, String)> {
            self.remote_commands.lock().unwrap().clone()
        }

        fn record(&self, transition: Transition) {
            self.transitions.lock().unwrap().push(transition);
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn resume(&self, box_name: &str) -> Result<ResumeOutcome> {
            self.record(Transition::Resume(box_name.to_string()));
            if self.fail_resume.contains(box_name) {
                return Err(Error::Backend(format!("resume of {box_name} exploded")));
            }
            if self.needs_up.contains(box_name) {
                Ok(ResumeOutcome::NeedsUp)
            } else {
                Ok(ResumeOutcome::Resumed)
            }
        }

        async fn up(&self, box_name: &str) -> Result<()> {
            self.record(Transition::Up(box_name.to_string()));
            if self.fail_up.contains(box_name) {
                return Err(Error::Backend(format!("up of {box_name} exploded")));
            }
            Ok(())
        }

        async fn suspend(&self, box_name: &str) -> Result<()> {
            self.record(Transition::Suspend(box_name.to_string()));
            Ok(())
        }

        async fn halt(&self, box_name: &str) -> Result<()> {
            self.record(Transition::Halt(box_name.to_string()));
            Ok(())
        }

        async fn destroy(&self, box_name: &str) -> Result<()> {
            self.record(Transition::Destroy(box_name.to_string()));
            Ok(())
        }

        async fn rsync(&self, box_name: &str) -> Result<()> {
            self.record(Transition::Rsync(box_name.to_string()));
            Ok(())
        }

        async fn run_remote(&self, box_name: &str, command: &str) -> Result<RemoteOutput> {
            self.remote_commands
                .lock()
                .unwrap()
                .push((box_name.to_string(), command.to_string()));
            let code = self
                .remote_exit_codes
                .iter()
                .find(|(fragment, _)| command.contains(fragment.as_str()))
                .map(|(_, code)| *code)
                .unwrap_or(0);
            Ok(RemoteOutput {
                code,
                output: String::new(),
            })
        }

        async fn open_session(&self, _box_name: &str, command: &str) -> Result<Session> {
            Session::spawn(Command::new("sh").arg("-c").arg(command))
        }
    }
}
