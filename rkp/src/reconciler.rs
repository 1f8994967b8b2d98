//! Drives a node's pods toward the manifests in its intent path.
//!
//! Every intent snapshot is diffed against the pods this node has applied
//! (its reality). The resulting actions run one at a time: stops first, then
//! updates, then installs, each in slot order. An action is recorded in the
//! reality path only after it succeeded, with a conditional write on the
//! reality key's last known revision.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use common::{DecodeError, HookType, Manifest, StorePaths, decode_manifest, slot_of};
use futures::StreamExt;
use libkv::{CasOutcome, KvEntry, KvStore, Snapshot, StoreError, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    executor::{PodError, PodExecutor},
    hooks::{HookError, HookExecutor},
    shutdown::LoopControl,
};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Consecutive failures after which a slot is reported as a standing error.
    pub failure_threshold: u32,
    /// Conditional-write conflicts tolerated per action.
    pub conflict_retries: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        ReconcilerSettings {
            failure_threshold: 3,
            conflict_retries: 3,
        }
    }
}

/// A pod this node has applied, as recorded in its reality path.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPod {
    pub manifest: Manifest,
    pub fingerprint: String,
    pub mod_revision: i64,
}

impl AppliedPod {
    fn new(manifest: Manifest, mod_revision: i64) -> Self {
        AppliedPod {
            fingerprint: manifest.fingerprint(),
            manifest,
            mod_revision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Install,
    Update,
    Stop,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Install => "install",
            ActionKind::Update => "update",
            ActionKind::Stop => "stop",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotAction {
    Install(Manifest),
    Update { from: Manifest, to: Manifest },
    Stop(Manifest),
}

impl SlotAction {
    pub fn slot(&self) -> &str {
        match self {
            SlotAction::Install(m) | SlotAction::Stop(m) => &m.id,
            SlotAction::Update { to, .. } => &to.id,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            SlotAction::Install(_) => ActionKind::Install,
            SlotAction::Update { .. } => ActionKind::Update,
            SlotAction::Stop(_) => ActionKind::Stop,
        }
    }

    /// The manifest reality should hold for the slot once the action is done.
    fn outcome(&self) -> Option<&Manifest> {
        match self {
            SlotAction::Install(m) => Some(m),
            SlotAction::Update { to, .. } => Some(to),
            SlotAction::Stop(_) => None,
        }
    }
}

/// What, if anything, takes `current` to `desired`.
pub fn plan_slot(desired: Option<&Manifest>, current: Option<&AppliedPod>) -> Option<SlotAction> {
    match (desired, current) {
        (Some(want), None) => Some(SlotAction::Install(want.clone())),
        (Some(want), Some(have)) if want.fingerprint() != have.fingerprint => {
            Some(SlotAction::Update {
                from: have.manifest.clone(),
                to: want.clone(),
            })
        }
        (None, Some(have)) => Some(SlotAction::Stop(have.manifest.clone())),
        _ => None,
    }
}

/// Actions that take `reality` to `intent`, leaving the `skip` slots alone.
pub fn plan(
    intent: &BTreeMap<String, Manifest>,
    reality: &BTreeMap<String, AppliedPod>,
    skip: &BTreeSet<String>,
) -> Vec<SlotAction> {
    let slots: BTreeSet<&String> = intent.keys().chain(reality.keys()).collect();
    let mut stops = Vec::new();
    let mut updates = Vec::new();
    let mut installs = Vec::new();
    for slot in slots.into_iter().filter(|s| !skip.contains(*s)) {
        match plan_slot(intent.get(slot), reality.get(slot)) {
            Some(action @ SlotAction::Stop(_)) => stops.push(action),
            Some(action @ SlotAction::Update { .. }) => updates.push(action),
            Some(action @ SlotAction::Install(_)) => installs.push(action),
            None => {}
        }
    }
    stops.into_iter().chain(updates).chain(installs).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotFailure {
    pub attempts: u32,
    pub last_error: String,
}

/// What one notification did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub revision: i64,
    pub installed: Vec<String>,
    pub updated: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: Vec<String>,
    /// Slots that were malformed or whose action failed, with the reason.
    pub failed: BTreeMap<String, String>,
    /// Slots whose action was not started because the loop was cancelled.
    pub not_attempted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn changed(&self) -> usize {
        self.installed.len() + self.updated.len() + self.stopped.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Pod(#[from] PodError),
    #[error("{hook_type} hooks refused the action: {source}")]
    Hook {
        hook_type: HookType,
        #[source]
        source: HookError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("reality record of {slot} kept changing, gave up after {attempts} attempts")]
    Conflict { slot: String, attempts: u32 },
    #[error("cannot encode manifest of {slot}: {source}")]
    Encode {
        slot: String,
        #[source]
        source: serde_yaml::Error,
    },
}

enum Applied {
    Done,
    /// Reality already held the outcome when re-read after a conflict.
    AlreadyRecorded,
}

pub struct PodReconciler {
    node: String,
    paths: StorePaths,
    store: Arc<dyn KvStore>,
    executor: Arc<dyn PodExecutor>,
    hooks: Arc<dyn HookExecutor>,
    settings: ReconcilerSettings,
    reality: BTreeMap<String, AppliedPod>,
    // mod_revision of every reality key seen, including ones that failed to decode
    revisions: BTreeMap<String, i64>,
    failures: BTreeMap<String, SlotFailure>,
}

impl PodReconciler {
    pub fn new(
        node: impl Into<String>,
        paths: StorePaths,
        store: Arc<dyn KvStore>,
        executor: Arc<dyn PodExecutor>,
        hooks: Arc<dyn HookExecutor>,
        settings: ReconcilerSettings,
    ) -> Self {
        PodReconciler {
            node: node.into(),
            paths,
            store,
            executor,
            hooks,
            settings,
            reality: BTreeMap::new(),
            revisions: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Pods this node has applied, by slot.
    pub fn reality(&self) -> &BTreeMap<String, AppliedPod> {
        &self.reality
    }

    pub fn failures(&self) -> &BTreeMap<String, SlotFailure> {
        &self.failures
    }

    /// Load the reality path so pods applied by an earlier run are not
    /// installed again.
    pub async fn bootstrap(&mut self) -> Result<(), StoreError> {
        let path = self.paths.reality_path(&self.node);
        let snapshot = self.store.list(&path).await?;
        self.reality.clear();
        self.revisions.clear();
        for entry in &snapshot.entries {
            self.absorb(slot_of(&entry.key).to_string(), Some(entry));
        }
        info!(
            node = %self.node,
            pods = self.reality.len(),
            revision = snapshot.revision,
            "loaded reality"
        );
        Ok(())
    }

    /// Reconcile one intent snapshot. Failures are per slot and end up in the
    /// report; they never stop the other slots.
    pub async fn reconcile(&mut self, snapshot: &Snapshot) -> ReconcileReport {
        self.reconcile_until(snapshot, &CancellationToken::new())
            .await
    }

    /// Like [`reconcile`](Self::reconcile), but no further action is started
    /// once `cancel` fires. An action already started, including its reality
    /// write, is finished first.
    pub async fn reconcile_until(
        &mut self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let mut report = ReconcileReport {
            revision: snapshot.revision,
            ..Default::default()
        };

        let (intent, skip) = self.decode_intent(snapshot, &mut report);
        for (slot, manifest) in &intent {
            let same = self
                .reality
                .get(slot)
                .is_some_and(|have| have.fingerprint == manifest.fingerprint());
            if same {
                report.unchanged.push(slot.clone());
                self.failures.remove(slot);
            }
        }

        for action in plan(&intent, &self.reality, &skip) {
            let slot = action.slot().to_string();
            if cancel.is_cancelled() {
                report.not_attempted.push(slot);
                continue;
            }
            let kind = action.kind();
            match self.apply(action).await {
                Ok(_) => {
                    self.failures.remove(&slot);
                    match kind {
                        ActionKind::Install => report.installed.push(slot),
                        ActionKind::Update => report.updated.push(slot),
                        ActionKind::Stop => report.stopped.push(slot),
                    }
                }
                Err(e) => {
                    self.record_failure(&slot, kind, &e);
                    report.failed.insert(slot, e.to_string());
                }
            }
        }
        if !report.not_attempted.is_empty() {
            info!(
                revision = report.revision,
                slots = ?report.not_attempted,
                "cancelled, remaining actions not started"
            );
        }
        report
    }

    /// Reconcile every snapshot until cancelled or the stream ends, then
    /// acknowledge through `control`. Returns itself so callers can inspect
    /// the final reality.
    pub async fn run(mut self, mut stream: WatchStream, control: LoopControl) -> Self {
        info!(node = %self.node, prefix = %stream.prefix(), "watching pod manifests");
        let cancel = control.token();
        loop {
            let next = tokio::select! {
                biased;
                _ = control.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(snapshot)) => {
                    let report = self.reconcile_until(&snapshot, &cancel).await;
                    if report.changed() > 0 || !report.is_clean() {
                        info!(
                            revision = report.revision,
                            installed = ?report.installed,
                            updated = ?report.updated,
                            stopped = ?report.stopped,
                            failed = report.failed.len(),
                            "reconciled"
                        );
                    } else {
                        debug!(revision = report.revision, "nothing to do");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "intent watch error"),
                None => break,
            }
        }
        stream.cancel();
        control.quiesce();
        self
    }

    fn decode_intent(
        &self,
        snapshot: &Snapshot,
        report: &mut ReconcileReport,
    ) -> (BTreeMap<String, Manifest>, BTreeSet<String>) {
        let path = self.paths.intent_path(&self.node);
        let mut intent = BTreeMap::new();
        let mut skip = BTreeSet::new();
        for entry in &snapshot.entries {
            let slot = slot_of(&entry.key).to_string();
            let nested = entry
                .key
                .strip_prefix(path.as_str())
                .is_none_or(|rest| rest.contains('/'));
            let decoded = if nested {
                Err(DecodeError::InvalidId(entry.key.clone()))
            } else {
                decode_manifest(&slot, &entry.value)
            };
            match decoded {
                Ok(manifest) => {
                    intent.insert(slot, manifest);
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "malformed manifest, slot left untouched");
                    report.failed.insert(slot.clone(), e.to_string());
                    skip.insert(slot);
                }
            }
        }
        (intent, skip)
    }

    async fn apply(&mut self, action: SlotAction) -> Result<(), ReconcileError> {
        let slot = action.slot().to_string();
        debug!(%slot, action = %action.kind(), "applying");

        match &action {
            SlotAction::Install(m) => {
                self.gate(HookType::BeforeInstall, m).await?;
                self.executor.install(m).await?;
            }
            SlotAction::Update { from, to } => {
                self.gate(HookType::BeforeInstall, to).await?;
                self.executor.update(from, to).await?;
            }
            SlotAction::Stop(m) => {
                self.gate(HookType::BeforeUninstall, m).await?;
                self.executor.stop(m).await?;
            }
        }

        match self.record(&slot, action.outcome()).await? {
            Applied::Done => {}
            Applied::AlreadyRecorded => debug!(%slot, "reality already up to date"),
        }

        if let Some(m) = action.outcome() {
            self.notify(HookType::AfterInstall, m).await;
            self.notify(HookType::AfterLaunch, m).await;
        }
        Ok(())
    }

    /// Run `before_*` hooks; any failure aborts the action.
    async fn gate(&self, hook_type: HookType, manifest: &Manifest) -> Result<(), ReconcileError> {
        self.hooks
            .run(hook_type, manifest)
            .await
            .map(|_| ())
            .map_err(|source| ReconcileError::Hook { hook_type, source })
    }

    /// Run `after_*` hooks; failures are only logged.
    async fn notify(&self, hook_type: HookType, manifest: &Manifest) {
        if let Err(e) = self.hooks.run(hook_type, manifest).await {
            warn!(pod = %manifest.id, %hook_type, error = %e, "hook failed after action");
        }
    }

    /// Make the slot's reality key hold `outcome` (or be absent), using
    /// conditional writes. On conflict the key is re-read; if it already holds
    /// the outcome nothing more is written, otherwise the write is retried on
    /// the fresh revision.
    async fn record(
        &mut self,
        slot: &str,
        outcome: Option<&Manifest>,
    ) -> Result<Applied, ReconcileError> {
        let key = self.paths.reality_key(&self.node, slot);
        let value = outcome
            .map(|m| m.to_yaml())
            .transpose()
            .map_err(|source| ReconcileError::Encode {
                slot: slot.to_string(),
                source,
            })?;

        let attempts = self.settings.conflict_retries + 1;
        for attempt in 1..=attempts {
            let expected = self.revisions.get(slot).copied().unwrap_or(0);
            let written = match &value {
                Some(yaml) => {
                    self.store
                        .put_if(&key, yaml.clone().into_bytes(), expected)
                        .await?
                }
                None => self.store.delete_if(&key, expected).await?,
            };
            match written {
                CasOutcome::Applied { revision } => {
                    match outcome {
                        Some(m) => {
                            self.revisions.insert(slot.to_string(), revision);
                            self.reality
                                .insert(slot.to_string(), AppliedPod::new(m.clone(), revision));
                        }
                        None => {
                            self.revisions.remove(slot);
                            self.reality.remove(slot);
                        }
                    }
                    return Ok(Applied::Done);
                }
                CasOutcome::Conflict => {
                    warn!(%slot, expected, attempt, "reality changed underneath us, re-reading");
                    let fresh = self.store.get(&key).await?;
                    self.absorb(slot.to_string(), fresh.as_ref());
                    if plan_slot(outcome, self.reality.get(slot)).is_none() {
                        return Ok(Applied::AlreadyRecorded);
                    }
                }
            }
        }
        Err(ReconcileError::Conflict {
            slot: slot.to_string(),
            attempts,
        })
    }

    /// Replace what is known about a slot's reality key with `entry`.
    fn absorb(&mut self, slot: String, entry: Option<&KvEntry>) {
        let Some(entry) = entry else {
            self.reality.remove(&slot);
            self.revisions.remove(&slot);
            return;
        };
        self.revisions.insert(slot.clone(), entry.mod_revision);
        match decode_manifest(&slot, &entry.value) {
            Ok(manifest) => {
                self.reality
                    .insert(slot, AppliedPod::new(manifest, entry.mod_revision));
            }
            Err(e) => {
                warn!(key = %entry.key, error = %e, "malformed reality record, treated as absent");
                self.reality.remove(&slot);
            }
        }
    }

    fn record_failure(&mut self, slot: &str, kind: ActionKind, e: &ReconcileError) {
        let failure = self
            .failures
            .entry(slot.to_string())
            .or_insert(SlotFailure {
                attempts: 0,
                last_error: String::new(),
            });
        failure.attempts += 1;
        failure.last_error = e.to_string();
        if failure.attempts >= self.settings.failure_threshold {
            error!(
                %slot,
                action = %kind,
                attempts = failure.attempts,
                error = %e,
                "slot keeps failing"
            );
        } else {
            warn!(
                %slot,
                action = %kind,
                attempts = failure.attempts,
                error = %e,
                "action failed, retrying on next change"
            );
        }
    }
}
