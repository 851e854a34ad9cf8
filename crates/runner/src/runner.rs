//! Run orchestration
//!
//! Sequences test cases grouped by box to minimize lifecycle churn: cases
//! are stable-sorted by box name, each adjacent box group costs one
//! ensure-up/quiesce pair, and once-per-run box preparation (uninstall,
//! rsync) happens the first time a box is seen.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};
use vmharness_common::{BoxState, CaseOutcome, CaseResult, Error, Result, RunSummary, TestCase};

use crate::directives;
use crate::lifecycle::LifecycleManager;
use crate::provider::Provider;
use crate::session::Interpreter;
use crate::testfile;

/// File extension of discoverable test files.
pub const TEST_FILE_EXTENSION: &str = "t";

/// Remote commands run once per box when a pre-run uninstall is requested.
/// Each must exit zero.
const UNINSTALL_COMMANDS: &[&str] = &[
    "sudo pkill -9 sandstorm || true",
    "sudo rm -rf /opt/sandstorm",
    "sudo rm -rf $HOME/sandstorm",
    "if [ -e /proc/sys/kernel/unprivileged_userns_clone ] ; then echo 0 | sudo dd of=/proc/sys/kernel/unprivileged_userns_clone ; fi",
    "sudo pkill -9 sudo || true",
    "sudo hostname localhost",
    "sudo modprobe fuse",
];

/// Configuration for the test runner
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Uninstall previous installer state from each box before its first case.
    pub uninstall_first: bool,
    /// Sync the latest installer bits to each box before its first case.
    pub rsync: bool,
    /// Halt boxes instead of suspending them, and halt everything at run end.
    pub halt_afterward: bool,
}

/// Main test runner
pub struct Runner {
    lifecycle: LifecycleManager,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(provider: Arc<dyn Provider>, config: RunnerConfig) -> Self {
        Self {
            lifecycle: LifecycleManager::new(provider),
            config,
        }
    }

    /// Run all given test files and collect the per-case results.
    pub async fn run(&mut self, files: &[PathBuf]) -> RunSummary {
        let start = Instant::now();
        let mut results = Vec::new();
        let mut keep_going = true;

        // Parse everything up front; scheduling needs each case's box name.
        let mut cases = Vec::new();
        for file in files {
            match load_case(file) {
                Ok(case) => cases.push((file.clone(), case)),
                Err(err) => {
                    error!("✗ {} - {err}", file.display());
                    keep_going = false;
                    results.push(CaseResult {
                        file: file.display().to_string(),
                        box_name: String::new(),
                        title: None,
                        outcome: CaseOutcome::Failed {
                            reason: err.to_string(),
                        },
                        duration_ms: 0,
                    });
                }
            }
        }

        // Stable sort keyed solely by box name: same-box cases become
        // adjacent while keeping their relative order.
        cases.sort_by(|(_, a), (_, b)| a.box_name.cmp(&b.box_name));

        let mut previous_box: Option<String> = None;
        let mut prepared: HashSet<String> = HashSet::new();
        let mut touched: Vec<String> = Vec::new();

        for (file, case) in &cases {
            let boundary = previous_box.as_deref() != Some(case.box_name.as_str());
            if boundary {
                if let Some(prev) = previous_box.take() {
                    if touched.contains(&prev) {
                        if let Err(err) = self
                            .lifecycle
                            .quiesce(&prev, self.config.halt_afterward)
                            .await
                        {
                            warn!("failed to quiesce box {prev}: {err}");
                        }
                    }
                }
            }
            previous_box = Some(case.box_name.clone());

            if !keep_going {
                results.push(CaseResult {
                    file: file.display().to_string(),
                    box_name: case.box_name.clone(),
                    title: case.title.clone(),
                    outcome: CaseOutcome::Skipped,
                    duration_ms: 0,
                });
                continue;
            }

            let result = match self.prepare_box(&case.box_name, &mut prepared, &mut touched).await
            {
                Ok(()) => self.run_case(file, case).await,
                Err(err) => {
                    error!("✗ {} - box preparation failed: {err}", file.display());
                    CaseResult {
                        file: file.display().to_string(),
                        box_name: case.box_name.clone(),
                        title: case.title.clone(),
                        outcome: CaseOutcome::Failed {
                            reason: err.to_string(),
                        },
                        duration_ms: 0,
                    }
                }
            };
            if !result.outcome.is_pass() {
                keep_going = false;
            }
            results.push(result);
        }

        // Quiesce the final box group, then honor the run-end halt flag for
        // every box touched during the run.
        if let Some(prev) = previous_box {
            if touched.contains(&prev) && !self.config.halt_afterward {
                if let Err(err) = self.lifecycle.quiesce(&prev, false).await {
                    warn!("failed to quiesce box {prev}: {err}");
                }
            }
        }
        if self.config.halt_afterward {
            for box_name in &touched {
                if self.lifecycle.state(box_name) != BoxState::Halted {
                    if let Err(err) = self.lifecycle.quiesce(box_name, true).await {
                        warn!("failed to halt box {box_name}: {err}");
                    }
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let passed = results.iter().filter(|r| r.outcome.is_pass()).count();
        let skipped = results
            .iter()
            .filter(|r| matches!(r.outcome, CaseOutcome::Skipped))
            .count();
        let failed = results.len() - passed - skipped;

        info!("Test results: {passed} passed, {failed} failed, {skipped} skipped ({duration_ms} ms)");

        RunSummary {
            total: results.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        }
    }

    /// Bring the box up; the first time a box is seen in the run, also apply
    /// the requested once-per-run preparation steps.
    async fn prepare_box(
        &mut self,
        box_name: &str,
        prepared: &mut HashSet<String>,
        touched: &mut Vec<String>,
    ) -> Result<()> {
        self.lifecycle.ensure_up(box_name).await?;
        if !touched.iter().any(|b| b == box_name) {
            touched.push(box_name.to_string());
        }
        if prepared.contains(box_name) {
            return Ok(());
        }
        if self.config.uninstall_first {
            info!("uninstalling previous installer state from box {box_name}");
            for command in UNINSTALL_COMMANDS {
                let result = self.lifecycle.provider().run_remote(box_name, command).await?;
                if result.code != 0 {
                    return Err(Error::Backend(format!(
                        "uninstall command {command:?} exited {}",
                        result.code
                    )));
                }
            }
        }
        if self.config.rsync {
            info!("syncing latest installer bits to box {box_name}");
            self.lifecycle.provider().rsync(box_name).await?;
        }
        prepared.insert(box_name.to_string());
        Ok(())
    }

    async fn run_case(&mut self, file: &Path, case: &TestCase) -> CaseResult {
        let start = Instant::now();
        info!(
            "*** running test from {} ({})",
            file.display(),
            case.title.as_deref().unwrap_or("untitled")
        );

        // Local expressions may chdir; restore whatever they changed so a
        // case cannot leak its working directory into the next one.
        let saved_cwd = std::env::current_dir().ok();
        let outcome = self.execute_case(case).await;
        if let Some(cwd) = saved_cwd {
            if let Err(err) = std::env::set_current_dir(&cwd) {
                warn!("failed to restore working directory {}: {err}", cwd.display());
            }
        }

        let outcome = match outcome {
            Ok(()) => {
                info!("✓ {}", file.display());
                CaseOutcome::Passed
            }
            Err(err) => {
                error!("✗ {} - {err}", file.display());
                CaseOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        CaseResult {
            file: file.display().to_string(),
            box_name: case.box_name.clone(),
            title: case.title.clone(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn execute_case(&mut self, case: &TestCase) -> Result<()> {
        directives::apply_destroy_ifs(case, &mut self.lifecycle).await?;

        if let Err(err) = directives::check_preconditions(case, &mut self.lifecycle).await {
            directives::run_cleanups(case);
            return Err(err);
        }

        let mut interpreter = Interpreter::new(self.lifecycle.provider(), &case.box_name);
        let script_result = interpreter.run_script(&case.script).await;
        drop(interpreter);

        // Postconditions and cleanups run even when the script failed; the
        // script failure stays the case's primary reason.
        let post_result = directives::check_postconditions(case);
        directives::run_cleanups(case);
        script_result?;
        post_result
    }
}

fn load_case(file: &Path) -> Result<TestCase> {
    let content = std::fs::read_to_string(file)?;
    testfile::parse(&content)
}

/// All `*.t` files directly under `dir`, in sorted filename order.
pub fn discover_test_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext == TEST_FILE_EXTENSION)
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    Ok(files)
}

/// Write the run summary as JSON next to the other run artifacts.
pub fn write_results(summary: &RunSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(summary)
        .map_err(|err| Error::Backend(format!("unable to serialize results: {err}")))?;
    std::fs::write(path, json)?;
    info!("Results written to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_filters_by_extension_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.t", "a.t", "notes.txt", "c.t"] {
            std::fs::write(dir.path().join(name), "vagrant-box: x\n\n").unwrap();
        }
        let files = discover_test_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.t", "b.t", "c.t"]);
    }

    #[test]
    fn results_serialize_to_json() {
        let summary = RunSummary {
            total: 1,
            passed: 1,
            failed: 0,
            skipped: 0,
            duration_ms: 12,
            results: vec![CaseResult {
                file: "a.t".to_string(),
                box_name: "default".to_string(),
                title: None,
                outcome: CaseOutcome::Passed,
                duration_ms: 12,
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results/run.json");
        write_results(&summary, &path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"outcome\": \"passed\""));
    }
}
