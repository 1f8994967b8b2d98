//! Lifecycle hooks: executables run around pod actions and on demand through
//! hook bindings in the store.

use std::{fmt, io, path::PathBuf};

use async_trait::async_trait;
use common::{HookType, Manifest};

pub mod runner;
pub mod watch;

pub use runner::HookRunner;
pub use watch::{HookFailure, HookSweepReport, HookWatchLoop};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Succeeded,
    Failed { code: Option<i32>, stderr: String },
    TimedOut,
    NotStarted(String),
}

/// Outcome of one hook executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub name: String,
    pub outcome: HookOutcome,
}

impl HookResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == HookOutcome::Succeeded
    }
}

/// Every hook run for one (hook type, pod) pair, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookReport {
    pub hook_type: HookType,
    pub pod_id: String,
    pub results: Vec<HookResult>,
}

impl HookReport {
    pub fn new(hook_type: HookType, pod_id: impl Into<String>) -> Self {
        HookReport {
            hook_type,
            pod_id: pod_id.into(),
            results: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &HookResult> {
        self.results.iter().filter(|r| !r.succeeded())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl fmt::Display for HookReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed: Vec<&str> = self.failures().map(|r| r.name.as_str()).collect();
        write!(
            f,
            "{} of {} {} hook(s) failed for pod {}",
            failed.len(),
            self.results.len(),
            self.hook_type,
            self.pod_id
        )?;
        if !failed.is_empty() {
            write!(f, " ({})", failed.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(HookReport),
    #[error("cannot read hooks directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot stage manifest of pod {pod_id} for hooks: {reason}")]
    Manifest { pod_id: String, reason: String },
}

/// Runs the hooks of one type for a pod.
///
/// Returns `Err(HookError::Failed)` if any hook failed; the report inside still
/// lists every hook that ran.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn run(&self, hook_type: HookType, manifest: &Manifest) -> Result<HookReport, HookError>;
}
