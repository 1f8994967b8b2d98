use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use common::Manifest;
use tokio::process::Command;
use tracing::{debug, info};

use crate::command::{CommandError, run_command};

#[derive(Debug, thiserror::Error)]
pub enum PodError {
    #[error("{action} of pod {pod_id} failed: {source}")]
    Launcher {
        action: &'static str,
        pod_id: String,
        #[source]
        source: CommandError,
    },
    #[error("cannot serialize manifest of pod {pod_id}: {source}")]
    Manifest {
        pod_id: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("pod {pod_id}: {reason}")]
    Rejected { pod_id: String, reason: String },
}

/// Runs pods on this node.
///
/// `install` of a manifest whose fingerprint is already running must succeed
/// without doing anything. `update` must leave `desired` running when it
/// returns `Ok`; stopping `current` and then installing `desired` is an
/// acceptable way to do that, and is what [`LauncherExecutor`] does.
///
/// `stop` must succeed for a pod that is not running. A failed update may
/// already have stopped `current`, and the retry on the next notification
/// stops it again.
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn install(&self, manifest: &Manifest) -> Result<(), PodError>;

    async fn update(&self, current: &Manifest, desired: &Manifest) -> Result<(), PodError>;

    async fn stop(&self, manifest: &Manifest) -> Result<(), PodError>;
}

/// Delegates pod supervision to an external launcher executable, called as
/// `<launcher> install|stop <pod-id>` with the manifest YAML on stdin. The
/// launcher's `stop` has to exit 0 for a pod it is not running.
#[derive(Debug, Clone)]
pub struct LauncherExecutor {
    launcher: PathBuf,
    node: String,
    timeout: Duration,
}

impl LauncherExecutor {
    pub fn new(launcher: impl Into<PathBuf>, node: impl Into<String>, timeout: Duration) -> Self {
        LauncherExecutor {
            launcher: launcher.into(),
            node: node.into(),
            timeout,
        }
    }

    async fn invoke(&self, action: &'static str, manifest: &Manifest) -> Result<(), PodError> {
        let yaml = manifest.to_yaml().map_err(|source| PodError::Manifest {
            pod_id: manifest.id.clone(),
            source,
        })?;
        let mut cmd = Command::new(&self.launcher);
        cmd.arg(action)
            .arg(&manifest.id)
            .env("RKP_POD_ID", &manifest.id)
            .env("RKP_POD_FINGERPRINT", manifest.fingerprint())
            .env("RKP_NODE", &self.node);

        debug!(pod = %manifest.id, action, launcher = %self.launcher.display(), "invoking launcher");
        let output = run_command(cmd, Some(yaml.as_bytes()), self.timeout)
            .await
            .map_err(|source| PodError::Launcher {
                action,
                pod_id: manifest.id.clone(),
                source,
            })?;
        if !output.stdout.is_empty() {
            debug!(pod = %manifest.id, action, stdout = %output.stdout, "launcher output");
        }
        Ok(())
    }
}

#[async_trait]
impl PodExecutor for LauncherExecutor {
    async fn install(&self, manifest: &Manifest) -> Result<(), PodError> {
        self.invoke("install", manifest).await?;
        info!(pod = %manifest.id, image = %manifest.image, "pod installed");
        Ok(())
    }

    async fn update(&self, current: &Manifest, desired: &Manifest) -> Result<(), PodError> {
        self.invoke("stop", current).await?;
        self.invoke("install", desired).await?;
        info!(pod = %desired.id, image = %desired.image, "pod updated");
        Ok(())
    }

    async fn stop(&self, manifest: &Manifest) -> Result<(), PodError> {
        self.invoke("stop", manifest).await?;
        info!(pod = %manifest.id, "pod stopped");
        Ok(())
    }
}
