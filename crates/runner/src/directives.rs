//! Header directive evaluation
//!
//! Directives run in phases around the session script: destroy-if conditions
//! and preconditions before it, postconditions and cleanups after it.
//! Remote conditions execute on the case's box over the backend's shell
//! channel; local conditions use the [`crate::condition`] sublanguage.

use tracing::{info, warn};
use vmharness_common::{Error, PostconditionFailure, Result, TestCase};

use crate::condition;
use crate::lifecycle::LifecycleManager;

/// Wrap a shell boolean condition so that the exit code reports whether it
/// holds on the box.
pub fn as_shell_probe(condition: &str) -> String {
    format!("if [ {condition} ] ; then exit 0 ; else exit 1 ; fi")
}

/// Destroy and re-establish the box for each destroy-if condition that holds.
pub async fn apply_destroy_ifs(case: &TestCase, lifecycle: &mut LifecycleManager) -> Result<()> {
    for cond in case.destroy_ifs() {
        let probe = as_shell_probe(cond);
        let result = lifecycle.provider().run_remote(&case.box_name, &probe).await?;
        if result.code == 0 {
            info!(
                "destroy condition [ {cond} ] holds, resetting box {}",
                case.box_name
            );
            lifecycle.destroy(&case.box_name).await?;
            lifecycle.ensure_up(&case.box_name).await?;
        }
    }
    Ok(())
}

/// Check every precondition. The first failing one aborts the case.
pub async fn check_preconditions(case: &TestCase, lifecycle: &mut LifecycleManager) -> Result<()> {
    for cond in case.remote_preconditions() {
        info!("checking remote precondition [ {cond} ]");
        let result = lifecycle
            .provider()
            .run_remote(&case.box_name, &as_shell_probe(cond))
            .await?;
        if result.code != 0 {
            return Err(Error::PreconditionFailed(cond.to_string()));
        }
    }
    for expr in case.local_preconditions() {
        info!("checking precondition {expr}");
        if !condition::eval(expr)?.truthy() {
            return Err(Error::PreconditionFailed(expr.to_string()));
        }
    }
    Ok(())
}

/// Check every postcondition, without short-circuiting, so a single run
/// surfaces every failing assertion.
pub fn check_postconditions(case: &TestCase) -> Result<()> {
    let mut failures = Vec::new();
    for expr in case.postconditions() {
        match condition::eval(expr) {
            Ok(value) if value.truthy() => info!("postcondition {expr} holds"),
            Ok(value) => {
                warn!("postcondition {expr} failed, was {value}");
                failures.push(PostconditionFailure {
                    expression: expr.to_string(),
                    observed: value.to_string(),
                });
            }
            Err(err) => {
                warn!("postcondition {expr} did not evaluate: {err}");
                failures.push(PostconditionFailure {
                    expression: expr.to_string(),
                    observed: err.to_string(),
                });
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::PostconditionFailed { failures })
    }
}

/// Run every cleanup expression, best effort. Failures are logged and never
/// override the case's already-determined outcome.
pub fn run_cleanups(case: &TestCase) {
    for expr in case.cleanups() {
        info!("running cleanup {expr}");
        if let Err(err) = condition::eval(expr) {
            warn!("cleanup {expr} failed: {err}");
        }
    }
}
