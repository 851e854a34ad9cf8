//! VM lifecycle management
//!
//! Brings named boxes into a connectable state with minimal redundant
//! transitions. The manager is the sole mutator of the recorded box state;
//! the record is an advisory cache over the backend's authoritative state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use vmharness_common::{BoxState, Error, Result};

use crate::provider::{Provider, ResumeOutcome};

pub struct LifecycleManager {
    provider: Arc<dyn Provider>,
    states: HashMap<String, BoxState>,
}

impl LifecycleManager {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            states: HashMap::new(),
        }
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    /// Recorded state for a box. Advisory only.
    pub fn state(&self, box_name: &str) -> BoxState {
        self.states.get(box_name).copied().unwrap_or_default()
    }

    /// Bring a box to a connectable state: try `resume` first and fall back
    /// to a full `up` when the backend reports there is nothing to resume.
    /// Resume failures are common and recoverable, so any other resume error
    /// is logged and also falls back to `up`.
    pub async fn ensure_up(&mut self, box_name: &str) -> Result<()> {
        if self.state(box_name) == BoxState::Up {
            return Ok(());
        }
        let start = Instant::now();
        match self.provider.resume(box_name).await {
            Ok(ResumeOutcome::Resumed) => {
                info!("resumed box {box_name} [{:.1?}]", start.elapsed());
                self.states.insert(box_name.to_string(), BoxState::Up);
                return Ok(());
            }
            Ok(ResumeOutcome::NeedsUp) => {}
            Err(err) => {
                warn!("resume of box {box_name} failed, falling back to up: {err}");
            }
        }
        self.provider.up(box_name).await.map_err(|err| {
            warn!("up of box {box_name} failed: {err}");
            Error::LifecycleTransitionFailed {
                box_name: box_name.to_string(),
                operation: "up".to_string(),
            }
        })?;
        info!("brought up box {box_name} [{:.1?}]", start.elapsed());
        self.states.insert(box_name.to_string(), BoxState::Up);
        Ok(())
    }

    /// Suspend the box, or halt it when the caller wants a full stop.
    pub async fn quiesce(&mut self, box_name: &str, to_halt: bool) -> Result<()> {
        let (result, state, operation) = if to_halt {
            (self.provider.halt(box_name).await, BoxState::Halted, "halt")
        } else {
            (
                self.provider.suspend(box_name).await,
                BoxState::Suspended,
                "suspend",
            )
        };
        result.map_err(|err| {
            warn!("{operation} of box {box_name} failed: {err}");
            Error::LifecycleTransitionFailed {
                box_name: box_name.to_string(),
                operation: operation.to_string(),
            }
        })?;
        info!("{operation}ed box {box_name}");
        self.states.insert(box_name.to_string(), state);
        Ok(())
    }

    /// Destroy the box. Irrecoverable; used only by the destroy-if directive.
    pub async fn destroy(&mut self, box_name: &str) -> Result<()> {
        self.provider.destroy(box_name).await.map_err(|err| {
            warn!("destroy of box {box_name} failed: {err}");
            Error::LifecycleTransitionFailed {
                box_name: box_name.to_string(),
                operation: "destroy".to_string(),
            }
        })?;
        info!("destroyed box {box_name}");
        self.states.insert(box_name.to_string(), BoxState::Destroyed);
        Ok(())
    }
}
