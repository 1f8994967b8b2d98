#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use common::{HookType, Manifest, StorePaths};
use libkv::{KvStore, MemStore};
use rkp::{
    executor::{PodError, PodExecutor},
    hooks::{HookError, HookExecutor, HookOutcome, HookReport, HookResult},
    reconciler::{PodReconciler, ReconcilerSettings},
};

pub const NODE: &str = "node-1";

/// Ordered record of everything the fakes were asked to do.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, line: String) {
        self.0.lock().unwrap().push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct ExecutorState {
    running: BTreeMap<String, String>,
    failing: BTreeMap<String, usize>,
    delay: Duration,
}

/// Pod executor that keeps "running" pods in memory.
#[derive(Clone, Default)]
pub struct FakeExecutor {
    journal: Journal,
    state: Arc<Mutex<ExecutorState>>,
}

impl FakeExecutor {
    pub fn new(journal: Journal) -> Self {
        FakeExecutor {
            journal,
            state: Arc::default(),
        }
    }

    /// pod id -> image of every running pod
    pub fn running(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().running.clone()
    }

    /// Make the next `times` actions on `pod` fail.
    pub fn fail(&self, pod: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(pod.to_string(), times);
    }

    /// Make every action take `delay`.
    pub fn slow(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    async fn pause(&self) {
        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self, pod: &str) -> Result<(), PodError> {
        let mut state = self.state.lock().unwrap();
        let left = state.failing.entry(pod.to_string()).or_insert(0);
        if *left > 0 {
            *left -= 1;
            return Err(PodError::Rejected {
                pod_id: pod.to_string(),
                reason: "launcher exploded".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PodExecutor for FakeExecutor {
    async fn install(&self, manifest: &Manifest) -> Result<(), PodError> {
        self.journal.push(format!("install {}", manifest.id));
        self.pause().await;
        self.check(&manifest.id)?;
        self.state
            .lock()
            .unwrap()
            .running
            .insert(manifest.id.clone(), manifest.image.clone());
        Ok(())
    }

    async fn update(&self, current: &Manifest, desired: &Manifest) -> Result<(), PodError> {
        self.journal
            .push(format!("update {} {} -> {}", desired.id, current.image, desired.image));
        self.pause().await;
        self.check(&desired.id)?;
        self.state
            .lock()
            .unwrap()
            .running
            .insert(desired.id.clone(), desired.image.clone());
        Ok(())
    }

    async fn stop(&self, manifest: &Manifest) -> Result<(), PodError> {
        self.journal.push(format!("stop {}", manifest.id));
        self.pause().await;
        self.check(&manifest.id)?;
        self.state.lock().unwrap().running.remove(&manifest.id);
        Ok(())
    }
}

/// Hook executor that journals calls and fails for chosen (type, pod) pairs.
#[derive(Clone, Default)]
pub struct FakeHooks {
    journal: Journal,
    failing: Arc<Mutex<BTreeSet<(HookType, String)>>>,
    delay: Arc<Mutex<Duration>>,
}

impl FakeHooks {
    pub fn new(journal: Journal) -> Self {
        FakeHooks {
            journal,
            failing: Arc::default(),
            delay: Arc::default(),
        }
    }

    pub fn fail(&self, hook_type: HookType, pod: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((hook_type, pod.to_string()));
    }

    /// Make every hook run take `delay`.
    pub fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl HookExecutor for FakeHooks {
    async fn run(&self, hook_type: HookType, manifest: &Manifest) -> Result<HookReport, HookError> {
        self.journal.push(format!("hook {hook_type} {}", manifest.id));
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut report = HookReport::new(hook_type, manifest.id.clone());
        let fails = self
            .failing
            .lock()
            .unwrap()
            .contains(&(hook_type, manifest.id.clone()));
        report.results.push(HookResult {
            name: "fake".to_string(),
            outcome: if fails {
                HookOutcome::Failed {
                    code: Some(1),
                    stderr: "refused".to_string(),
                }
            } else {
                HookOutcome::Succeeded
            },
        });
        if fails {
            Err(HookError::Failed(report))
        } else {
            Ok(report)
        }
    }
}

pub struct Harness {
    pub store: MemStore,
    pub paths: StorePaths,
    pub journal: Journal,
    pub executor: FakeExecutor,
    pub hooks: FakeHooks,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Journal::default();
        Harness {
            store: MemStore::new(),
            paths: StorePaths::default(),
            executor: FakeExecutor::new(journal.clone()),
            hooks: FakeHooks::new(journal.clone()),
            journal,
        }
    }

    pub fn reconciler(&self) -> PodReconciler {
        self.reconciler_with(ReconcilerSettings::default())
    }

    pub fn reconciler_with(&self, settings: ReconcilerSettings) -> PodReconciler {
        PodReconciler::new(
            NODE,
            self.paths.clone(),
            Arc::new(self.store.clone()),
            Arc::new(self.executor.clone()),
            Arc::new(self.hooks.clone()),
            settings,
        )
    }

    pub fn shared_store(&self) -> Arc<dyn KvStore> {
        Arc::new(self.store.clone())
    }

    pub async fn put_intent(&self, manifest: &Manifest) -> i64 {
        self.store
            .put(
                &self.paths.intent_key(NODE, &manifest.id),
                manifest.to_yaml().unwrap(),
            )
            .await
    }

    pub async fn put_intent_raw(&self, slot: &str, raw: &str) -> i64 {
        self.store
            .put(&self.paths.intent_key(NODE, slot), raw)
            .await
    }

    pub async fn delete_intent(&self, slot: &str) {
        self.store
            .delete(&self.paths.intent_key(NODE, slot))
            .await;
    }

    pub async fn intent(&self) -> libkv::Snapshot {
        self.store
            .list(&self.paths.intent_path(NODE))
            .await
            .unwrap()
    }

    /// slot -> image, as recorded in the reality path
    pub async fn reality(&self) -> BTreeMap<String, String> {
        let snapshot = self
            .store
            .list(&self.paths.reality_path(NODE))
            .await
            .unwrap();
        snapshot
            .entries
            .iter()
            .map(|e| {
                let m: Manifest = serde_yaml::from_slice(&e.value).unwrap();
                (m.id, m.image)
            })
            .collect()
    }
}

pub fn pod(id: &str, image: &str) -> Manifest {
    Manifest::new(id, image)
}

/// Poll `check` until it holds or two seconds have passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
