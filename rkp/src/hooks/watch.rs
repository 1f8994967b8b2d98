use std::sync::Arc;

use common::{HookBinding, StorePaths, decode_manifest};
use futures::StreamExt;
use libkv::{Snapshot, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HookExecutor;
use crate::shutdown::LoopControl;

/// A hook binding that could not be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub key: String,
    pub reason: String,
}

/// What one pass over the hooks subtree did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSweepReport {
    pub revision: i64,
    pub executed: Vec<HookBinding>,
    /// Bindings scoped to other nodes.
    pub skipped: usize,
    pub failed: Vec<HookFailure>,
    /// Keys of bindings not run because the loop was cancelled.
    pub not_attempted: Vec<String>,
}

/// Runs every hook binding that applies to this node, on every change to the
/// hooks subtree. Keeps no state between notifications.
pub struct HookWatchLoop {
    node: String,
    paths: StorePaths,
    hooks: Arc<dyn HookExecutor>,
}

impl HookWatchLoop {
    pub fn new(node: impl Into<String>, paths: StorePaths, hooks: Arc<dyn HookExecutor>) -> Self {
        HookWatchLoop {
            node: node.into(),
            paths,
            hooks,
        }
    }

    pub async fn handle(&self, snapshot: &Snapshot) -> HookSweepReport {
        self.handle_until(snapshot, &CancellationToken::new()).await
    }

    /// Like [`handle`](Self::handle), but no binding is started once `cancel`
    /// fires.
    pub async fn handle_until(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> HookSweepReport {
        let mut report = HookSweepReport {
            revision: snapshot.revision,
            ..Default::default()
        };

        for entry in &snapshot.entries {
            if cancel.is_cancelled() {
                report.not_attempted.push(entry.key.clone());
                continue;
            }
            let binding = match self.paths.parse_hook_key(&entry.key) {
                Ok(binding) => binding,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "ignoring hook binding");
                    report.failed.push(HookFailure {
                        key: entry.key.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !binding.scope.applies_to(&self.node) {
                report.skipped += 1;
                continue;
            }
            let manifest = match decode_manifest(&binding.pod_id, &entry.value) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "malformed hook manifest");
                    report.failed.push(HookFailure {
                        key: entry.key.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            debug!(key = %entry.key, hook_type = %binding.hook_type, "running hook binding");
            match self.hooks.run(binding.hook_type, &manifest).await {
                Ok(_) => report.executed.push(binding),
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "hook binding failed");
                    report.failed.push(HookFailure {
                        key: entry.key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Handle snapshots until cancelled, then acknowledge through `control`.
    pub async fn run(self, mut stream: WatchStream, control: LoopControl) {
        info!(node = %self.node, prefix = %stream.prefix(), "watching hook bindings");
        let cancel = control.token();
        loop {
            let next = tokio::select! {
                biased;
                _ = control.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(snapshot)) => {
                    let report = self.handle_until(&snapshot, &cancel).await;
                    info!(
                        revision = report.revision,
                        executed = report.executed.len(),
                        failed = report.failed.len(),
                        not_attempted = report.not_attempted.len(),
                        "hook sweep finished"
                    );
                }
                Some(Err(e)) => warn!(error = %e, "hook watch error"),
                None => break,
            }
        }
        stream.cancel();
        control.quiesce();
    }
}
