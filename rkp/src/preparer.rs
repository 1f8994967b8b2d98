use std::sync::Arc;

use anyhow::{Context, Result};
use libkv::{KvStore, XlineStore, watch};
use tracing::{info, warn};

use crate::{
    config::PreparerConfig,
    executor::{LauncherExecutor, PodExecutor},
    hooks::{HookExecutor, HookRunner, HookWatchLoop},
    reconciler::PodReconciler,
    shutdown::{AckStatus, ShutdownCoordinator, ShutdownReport, SignalSource, loop_channel},
};

/// The preparer process: a pod reconciler and a hook loop over one store,
/// stopped together by a [`ShutdownCoordinator`].
pub struct Preparer {
    config: PreparerConfig,
    store: Arc<dyn KvStore>,
    executor: Arc<dyn PodExecutor>,
    hooks: Arc<dyn HookExecutor>,
}

impl Preparer {
    /// Connect to Xline and set up the launcher and hook runner from `config`.
    pub async fn connect(config: PreparerConfig) -> Result<Self> {
        let store = XlineStore::connect(&config.xline_config)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to xline at {:?}",
                    config.xline_config.endpoints
                )
            })?;
        let executor = LauncherExecutor::new(
            &config.pod_launcher,
            &config.node_name,
            config.launcher_timeout(),
        );
        let hooks = HookRunner::new(
            &config.hooks_directory,
            &config.node_name,
            config.hook_timeout(),
        );
        Ok(Self::with_parts(
            config,
            Arc::new(store),
            Arc::new(executor),
            Arc::new(hooks),
        ))
    }

    pub fn with_parts(
        config: PreparerConfig,
        store: Arc<dyn KvStore>,
        executor: Arc<dyn PodExecutor>,
        hooks: Arc<dyn HookExecutor>,
    ) -> Self {
        Preparer {
            config,
            store,
            executor,
            hooks,
        }
    }

    /// Start both loops and block until a signal from `signals` has shut them
    /// down. Fails only if the reality path cannot be read at start-up.
    pub async fn run<S: SignalSource + ?Sized>(self, signals: &mut S) -> Result<ShutdownReport> {
        let node = self.config.node_name.clone();
        let paths = self.config.store_paths();
        let options = self.config.watch_options();

        let mut reconciler = PodReconciler::new(
            node.clone(),
            paths.clone(),
            self.store.clone(),
            self.executor,
            self.hooks.clone(),
            self.config.reconciler_settings(),
        );
        reconciler
            .bootstrap()
            .await
            .context("Failed to read reality at start-up")?;

        let (pod_control, pod_handle) = loop_channel("pods");
        let (hook_control, hook_handle) = loop_channel("hooks");

        let intent = watch(
            self.store.clone(),
            paths.intent_path(&node),
            options.clone(),
            pod_control.token(),
        );
        let bindings = watch(
            self.store.clone(),
            paths.hooks_root(),
            options,
            hook_control.token(),
        );

        let hook_loop = HookWatchLoop::new(node.clone(), paths, self.hooks);
        let pods_task = tokio::spawn(reconciler.run(intent, pod_control));
        let hooks_task = tokio::spawn(hook_loop.run(bindings, hook_control));
        info!(%node, "preparer started");

        let coordinator =
            ShutdownCoordinator::new(pod_handle, hook_handle, self.config.hook_grace());
        let report = coordinator.run(signals).await;

        if report.hooks == AckStatus::TimedOut {
            hooks_task.abort();
        }
        if let Ok(reconciler) = pods_task.await {
            info!(pods = reconciler.reality().len(), "final reality");
        } else {
            warn!("pod loop did not finish cleanly");
        }
        Ok(report)
    }
}
