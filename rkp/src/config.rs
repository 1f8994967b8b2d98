use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result, ensure};
use common::{DEFAULT_PREFIX, StorePaths};
use libkv::{WatchOptions, XlineConfig};
use serde::Deserialize;

use crate::reconciler::ReconcilerSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct PreparerConfig {
    // Falls back to the host name when empty.
    #[serde(default)]
    pub node_name: String,
    pub hooks_directory: PathBuf,
    #[serde(default)]
    pub pod_launcher: PathBuf,
    pub xline_config: XlineConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
    #[serde(default = "default_launcher_timeout_secs")]
    pub launcher_timeout_secs: u64,
    #[serde(default = "default_hook_grace_secs")]
    pub hook_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            failure_threshold: default_failure_threshold(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

fn default_hook_timeout_secs() -> u64 {
    60
}

fn default_launcher_timeout_secs() -> u64 {
    300
}

fn default_hook_grace_secs() -> u64 {
    30
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_conflict_retries() -> u32 {
    3
}

impl PreparerConfig {
    pub fn store_paths(&self) -> StorePaths {
        StorePaths::new(self.xline_config.prefix.as_deref().unwrap_or(DEFAULT_PREFIX))
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            initial_backoff: Duration::from_millis(self.watch.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.watch.max_backoff_ms),
            ..WatchOptions::default()
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            failure_threshold: self.reconcile.failure_threshold,
            conflict_retries: self.reconcile.conflict_retries,
        }
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn launcher_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher_timeout_secs)
    }

    pub fn hook_grace(&self) -> Duration {
        Duration::from_secs(self.hook_grace_secs)
    }

    /// Fill in the node name from the host name if the file left it out.
    pub fn resolve_node_name(&mut self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            self.node_name = host_name()?;
        }
        Ok(())
    }

    /// Checks that are fatal at start-up.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.xline_config.endpoints.is_empty(),
            "xline_config.endpoints must list at least one endpoint"
        );
        ensure!(!self.node_name.trim().is_empty(), "node_name is empty");
        ensure!(
            !self.node_name.contains('/'),
            "node_name {:?} may not contain '/'",
            self.node_name
        );
        ensure!(
            self.watch.initial_backoff_ms > 0,
            "watch.initial_backoff_ms must be positive"
        );
        ensure!(
            self.watch.max_backoff_ms >= self.watch.initial_backoff_ms,
            "watch.max_backoff_ms ({}) is below watch.initial_backoff_ms ({})",
            self.watch.max_backoff_ms,
            self.watch.initial_backoff_ms
        );
        ensure!(
            self.hooks_directory.is_dir(),
            "hooks_directory {} does not exist or is not a directory",
            self.hooks_directory.display()
        );
        ensure!(
            !self.pod_launcher.as_os_str().is_empty(),
            "pod_launcher is not set"
        );
        Ok(())
    }
}

pub fn host_name() -> Result<String> {
    gethostname::gethostname()
        .into_string()
        .map_err(|raw| anyhow::anyhow!("host name {raw:?} is not valid UTF-8"))
}

pub fn parse_config(content: &str) -> Result<PreparerConfig> {
    serde_yaml::from_str(content).context("Failed to parse YAML config")
}

/// Read and parse a config file without validating it.
pub fn read_config(path: &Path) -> Result<PreparerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&content)
}

/// Read, complete and validate the preparer config.
pub fn load_config(path: &Path) -> Result<PreparerConfig> {
    let mut cfg = read_config(path)?;
    cfg.resolve_node_name()?;
    cfg.validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(cfg)
}
