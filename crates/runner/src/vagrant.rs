//! Vagrant backend
//!
//! Production [`Provider`] implementation shelling out to `vagrant` in the
//! directory holding the Vagrantfile.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use vmharness_common::{Error, RemoteOutput, Result};

use crate::provider::{Provider, ResumeOutcome};
use crate::session::Session;

/// Backend replies meaning there is no checkpoint to resume from.
const NO_CHECKPOINT_MARKERS: &[&str] = &[
    "VM not created. Moving on",
    "Domain is not created",
    "Domain is not suspended",
];

fn reports_no_checkpoint(output: &str) -> bool {
    NO_CHECKPOINT_MARKERS
        .iter()
        .any(|marker| output.contains(marker))
}

pub struct VagrantProvider {
    /// Directory containing the Vagrantfile.
    work_dir: PathBuf,
}

impl VagrantProvider {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("vagrant");
        cmd.args(args)
            .current_dir(&self.work_dir)
            .env("VAGRANT_DEFAULT_PROVIDER", "libvirt");
        cmd
    }

    /// Run a vagrant command to completion, capturing its stdout.
    async fn call(&self, args: &[&str]) -> Result<RemoteOutput> {
        info!("$ vagrant {}", args.join(" "));
        let start = Instant::now();
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await?;
        debug!("vagrant {} finished [{:.1?}]", args.join(" "), start.elapsed());
        Ok(RemoteOutput {
            code: output.status.code().unwrap_or(-1),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn call_checked(&self, args: &[&str]) -> Result<()> {
        let result = self.call(args).await?;
        if result.code != 0 {
            return Err(Error::Backend(format!(
                "vagrant {} exited {}",
                args.join(" "),
                result.code
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for VagrantProvider {
    async fn resume(&self, box_name: &str) -> Result<ResumeOutcome> {
        let result = self.call(&["resume", box_name]).await?;
        if reports_no_checkpoint(&result.output) {
            return Ok(ResumeOutcome::NeedsUp);
        }
        if result.code != 0 {
            return Err(Error::Backend(format!(
                "vagrant resume {box_name} exited {}",
                result.code
            )));
        }
        Ok(ResumeOutcome::Resumed)
    }

    async fn up(&self, box_name: &str) -> Result<()> {
        self.call_checked(&["up", box_name]).await
    }

    async fn suspend(&self, box_name: &str) -> Result<()> {
        self.call_checked(&["suspend", box_name]).await
    }

    async fn halt(&self, box_name: &str) -> Result<()> {
        self.call_checked(&["halt", box_name]).await
    }

    async fn destroy(&self, box_name: &str) -> Result<()> {
        self.call_checked(&["destroy", "-f", box_name]).await
    }

    async fn rsync(&self, box_name: &str) -> Result<()> {
        self.call_checked(&["rsync", box_name]).await
    }

    async fn run_remote(&self, box_name: &str, command: &str) -> Result<RemoteOutput> {
        self.call(&["ssh", box_name, "-c", command]).await
    }

    async fn open_session(&self, box_name: &str, command: &str) -> Result<Session> {
        info!("$ vagrant ssh {box_name} -c {command:?}");
        let mut cmd = self.command(&["ssh", box_name, "-c", command]);
        Session::spawn(&mut cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_checkpoint_markers_are_detected() {
        assert!(reports_no_checkpoint(
            "==> default: VM not created. Moving on..."
        ));
        assert!(reports_no_checkpoint("Error: Domain is not suspended"));
        assert!(!reports_no_checkpoint("==> default: Resuming domain..."));
    }
}
