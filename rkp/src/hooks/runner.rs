use std::{
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use common::{HookType, Manifest};
use tokio::{fs, process::Command};
use tracing::{debug, info, warn};

use super::{HookError, HookExecutor, HookOutcome, HookReport, HookResult};
use crate::command::{CommandError, run_command};

/// Runs the executables found in `<directory>/<hook type>/`.
///
/// Hooks run one at a time in file-name order. Every hook gets the same
/// environment:
///
/// | variable | value |
/// |---|---|
/// | `HOOK` | hook type, e.g. `before_install` |
/// | `HOOK_POD_ID` | pod id |
/// | `HOOK_POD_FINGERPRINT` | manifest fingerprint |
/// | `HOOK_POD_MANIFEST` | path of a file holding the manifest YAML |
/// | `HOOK_NODE` | node name |
#[derive(Debug, Clone)]
pub struct HookRunner {
    directory: PathBuf,
    node: String,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(directory: impl Into<PathBuf>, node: impl Into<String>, timeout: Duration) -> Self {
        HookRunner {
            directory: directory.into(),
            node: node.into(),
            timeout,
        }
    }

    /// Executables for `hook_type`, sorted by file name. A missing directory
    /// means there are none.
    pub async fn discover(&self, hook_type: HookType) -> Result<Vec<PathBuf>, HookError> {
        let dir = self.directory.join(hook_type.as_str());
        let dir_error = |source: io::Error| HookError::Directory {
            path: dir.clone(),
            source,
        };
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(dir_error(e)),
        };

        let mut hooks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(dir_error)? {
            let path = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            // follows symlinks, unlike DirEntry::metadata
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(hook = %path.display(), error = %e, "cannot stat hook, skipped");
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            if meta.permissions().mode() & 0o111 == 0 {
                debug!(hook = %path.display(), "not executable, skipped");
                continue;
            }
            hooks.push(path);
        }
        hooks.sort();
        Ok(hooks)
    }

    async fn run_one(&self, hook: &Path, hook_type: HookType, manifest: &Manifest, staged: &Path) -> HookResult {
        let name = hook
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| hook.display().to_string());
        let mut cmd = Command::new(hook);
        cmd.env("HOOK", hook_type.as_str())
            .env("HOOK_POD_ID", &manifest.id)
            .env("HOOK_POD_FINGERPRINT", manifest.fingerprint())
            .env("HOOK_POD_MANIFEST", staged)
            .env("HOOK_NODE", &self.node);

        let outcome = match run_command(cmd, None, self.timeout).await {
            Ok(_) => {
                info!(hook = %name, %hook_type, pod = %manifest.id, "hook succeeded");
                HookOutcome::Succeeded
            }
            Err(e) => {
                warn!(hook = %name, %hook_type, pod = %manifest.id, error = %e, "hook failed");
                match e {
                    CommandError::Timeout { .. } => HookOutcome::TimedOut,
                    CommandError::Failed { status, stderr, .. } => HookOutcome::Failed {
                        code: status.code(),
                        stderr,
                    },
                    other => HookOutcome::NotStarted(other.to_string()),
                }
            }
        };
        HookResult { name, outcome }
    }
}

/// Write the manifest to a temp file the hooks can read. The file is removed
/// when the returned handle is dropped.
fn stage_manifest(manifest: &Manifest) -> Result<tempfile::NamedTempFile, HookError> {
    let stage_error = |reason: String| HookError::Manifest {
        pod_id: manifest.id.clone(),
        reason,
    };
    let yaml = manifest.to_yaml().map_err(|e| stage_error(e.to_string()))?;
    let mut file = tempfile::Builder::new()
        .prefix("rkp-hook-")
        .suffix(".yaml")
        .tempfile()
        .map_err(|e| stage_error(e.to_string()))?;
    file.write_all(yaml.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| stage_error(e.to_string()))?;
    Ok(file)
}

#[async_trait]
impl HookExecutor for HookRunner {
    async fn run(&self, hook_type: HookType, manifest: &Manifest) -> Result<HookReport, HookError> {
        let mut report = HookReport::new(hook_type, manifest.id.clone());
        let hooks = self.discover(hook_type).await?;
        if hooks.is_empty() {
            debug!(%hook_type, pod = %manifest.id, "no hooks installed");
            return Ok(report);
        }

        let staged = stage_manifest(manifest)?;
        for hook in &hooks {
            let result = self.run_one(hook, hook_type, manifest, staged.path()).await;
            report.results.push(result);
        }
        drop(staged);

        if report.is_success() {
            Ok(report)
        } else {
            Err(HookError::Failed(report))
        }
    }
}
