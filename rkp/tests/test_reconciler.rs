mod support;

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use common::HookType;
use libkv::{
    CasOutcome, KvEntry, KvStore, MemStore, Snapshot, StoreError, WatchOptions, watch,
};
use rkp::{reconciler::ReconcilerSettings, shutdown::loop_channel};
use support::{Harness, NODE, eventually, pod};
use tokio_util::sync::CancellationToken;

fn images(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_install_update_stop_scenario() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    reconciler.bootstrap().await.unwrap();

    h.put_intent(&pod("web", "web:1")).await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["web"]);
    assert!(report.is_clean());
    assert_eq!(h.reality().await, images(&[("web", "web:1")]));
    assert_eq!(h.executor.running(), images(&[("web", "web:1")]));

    h.put_intent(&pod("web", "web:2")).await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.updated, vec!["web"]);
    assert_eq!(h.reality().await, images(&[("web", "web:2")]));
    assert_eq!(h.executor.running(), images(&[("web", "web:2")]));

    h.delete_intent("web").await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.stopped, vec!["web"]);
    assert!(h.reality().await.is_empty());
    assert!(h.executor.running().is_empty());
    assert!(reconciler.reality().is_empty());

    assert_eq!(
        h.journal.lines(),
        vec![
            "hook before_install web",
            "install web",
            "hook after_install web",
            "hook after_launch web",
            "hook before_install web",
            "update web web:1 -> web:2",
            "hook after_install web",
            "hook after_launch web",
            "hook before_uninstall web",
            "stop web",
        ]
    );
}

#[tokio::test]
async fn test_redelivered_snapshot_is_a_no_op() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("web", "web:1")).await;
    h.put_intent(&pod("db", "db:1")).await;

    let snapshot = h.intent().await;
    reconciler.reconcile(&snapshot).await;
    let reality_rev = h.store.revision().await;
    h.journal.clear();

    let again = reconciler.reconcile(&snapshot).await;
    assert_eq!(again.changed(), 0);
    assert_eq!(again.unchanged, vec!["db", "web"]);
    assert!(h.journal.lines().is_empty());
    assert_eq!(h.store.revision().await, reality_rev, "no reality writes");
}

#[tokio::test]
async fn test_bootstrap_does_not_reinstall() {
    let h = Harness::new();
    h.put_intent(&pod("web", "web:1")).await;
    let mut first = h.reconciler();
    first.reconcile(&h.intent().await).await;
    h.journal.clear();

    // a restarted preparer
    let mut second = h.reconciler();
    second.bootstrap().await.unwrap();
    assert_eq!(second.reality().len(), 1);
    let report = second.reconcile(&h.intent().await).await;
    assert_eq!(report.unchanged, vec!["web"]);
    assert!(h.journal.lines().is_empty());
}

#[tokio::test]
async fn test_bootstrap_treats_malformed_reality_as_absent() {
    let h = Harness::new();
    h.store
        .put(&h.paths.reality_key(NODE, "web"), "garbage: [")
        .await;
    let mut reconciler = h.reconciler();
    reconciler.bootstrap().await.unwrap();
    assert!(reconciler.reality().is_empty());

    h.put_intent(&pod("web", "web:1")).await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["web"]);
    // the bad record is overwritten by a conditional write on its revision
    assert_eq!(h.reality().await, images(&[("web", "web:1")]));
}

#[tokio::test]
async fn test_malformed_slot_is_isolated() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("db", "db:1")).await;
    reconciler.reconcile(&h.intent().await).await;

    h.put_intent_raw("db", "id: db\nimage: [").await;
    h.put_intent_raw("cache", "id: not-cache\nimage: cache:1\n").await;
    h.put_intent(&pod("web", "web:1")).await;
    h.store
        .put(&format!("{}nested/pod", h.paths.intent_path(NODE)), "id: pod\nimage: x\n")
        .await;

    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["web"]);
    assert!(report.stopped.is_empty(), "malformed db must not be stopped");
    assert_eq!(
        report.failed.keys().collect::<Vec<_>>(),
        vec!["cache", "db", "pod"]
    );
    assert_eq!(h.reality().await, images(&[("db", "db:1"), ("web", "web:1")]));
    assert_eq!(h.executor.running(), images(&[("db", "db:1"), ("web", "web:1")]));
}

#[tokio::test]
async fn test_stops_run_before_updates_and_installs() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("old", "old:1")).await;
    h.put_intent(&pod("web", "web:1")).await;
    reconciler.reconcile(&h.intent().await).await;
    h.journal.clear();

    h.delete_intent("old").await;
    h.put_intent(&pod("web", "web:2")).await;
    h.put_intent(&pod("aaa", "aaa:1")).await;
    reconciler.reconcile(&h.intent().await).await;

    let actions: Vec<String> = h
        .journal
        .lines()
        .into_iter()
        .filter(|l| !l.starts_with("hook"))
        .collect();
    assert_eq!(
        actions,
        vec!["stop old", "update web web:1 -> web:2", "install aaa"]
    );
}

#[tokio::test]
async fn test_failed_action_is_retried_on_next_notification() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.executor.fail("web", 1);
    h.put_intent(&pod("web", "web:1")).await;
    h.put_intent(&pod("db", "db:1")).await;

    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["db"]);
    assert!(report.failed["web"].contains("launcher exploded"));
    assert_eq!(reconciler.failures()["web"].attempts, 1);
    assert_eq!(h.reality().await, images(&[("db", "db:1")]));

    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["web"]);
    assert!(reconciler.failures().is_empty());
    assert_eq!(h.reality().await, images(&[("db", "db:1"), ("web", "web:1")]));
}

#[tokio::test]
async fn test_failures_accumulate_past_threshold() {
    let h = Harness::new();
    let mut reconciler = h.reconciler_with(ReconcilerSettings {
        failure_threshold: 2,
        conflict_retries: 3,
    });
    h.executor.fail("web", 10);
    h.put_intent(&pod("web", "web:1")).await;

    for _ in 0..4 {
        let report = reconciler.reconcile(&h.intent().await).await;
        assert!(report.failed.contains_key("web"));
    }
    let failure = &reconciler.failures()["web"];
    assert_eq!(failure.attempts, 4);
    assert!(failure.last_error.contains("launcher exploded"));
    assert!(h.reality().await.is_empty());
}

#[tokio::test]
async fn test_before_hook_failure_aborts_action() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.hooks.fail(HookType::BeforeInstall, "web");
    h.put_intent(&pod("web", "web:1")).await;

    let report = reconciler.reconcile(&h.intent().await).await;
    assert!(report.failed["web"].contains("before_install"));
    assert!(!h.journal.lines().contains(&"install web".to_string()));
    assert!(h.reality().await.is_empty());
}

#[tokio::test]
async fn test_after_hook_failure_is_only_logged() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.hooks.fail(HookType::AfterInstall, "web");
    h.put_intent(&pod("web", "web:1")).await;

    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["web"]);
    assert!(report.is_clean());
    assert_eq!(h.reality().await, images(&[("web", "web:1")]));
    assert!(h.journal.lines().contains(&"hook after_launch web".to_string()));
}

#[tokio::test]
async fn test_reality_conflict_rereads_and_retries() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("web", "web:1")).await;
    reconciler.reconcile(&h.intent().await).await;

    // someone else touches our reality record
    let key = h.paths.reality_key(NODE, "web");
    h.store
        .put(&key, pod("web", "web:9").to_yaml().unwrap())
        .await;

    h.put_intent(&pod("web", "web:2")).await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.updated, vec!["web"]);
    assert_eq!(h.reality().await, images(&[("web", "web:2")]));
    let recorded = h.store.get(&key).await.unwrap().unwrap();
    assert_eq!(reconciler.reality()["web"].mod_revision, recorded.mod_revision);
}

#[tokio::test]
async fn test_conflict_with_matching_record_needs_no_write() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("web", "web:1")).await;
    reconciler.reconcile(&h.intent().await).await;

    // another writer already recorded exactly what we are about to record
    let key = h.paths.reality_key(NODE, "web");
    h.store
        .put(&key, pod("web", "web:2").to_yaml().unwrap())
        .await;
    let before = h.store.get(&key).await.unwrap().unwrap().mod_revision;

    h.put_intent(&pod("web", "web:2")).await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert!(report.is_clean());
    assert_eq!(
        h.store.get(&key).await.unwrap().unwrap().mod_revision,
        before
    );
}

/// Reports a conflict for every conditional write.
struct AlwaysConflicts(MemStore);

#[async_trait]
impl KvStore for AlwaysConflicts {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.0.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        self.0.list(prefix).await
    }

    async fn wait_for_change(&self, prefix: &str, after: i64) -> Result<i64, StoreError> {
        self.0.wait_for_change(prefix, after).await
    }

    async fn put_if(&self, _: &str, _: Vec<u8>, _: i64) -> Result<CasOutcome, StoreError> {
        Ok(CasOutcome::Conflict)
    }

    async fn delete_if(&self, _: &str, _: i64) -> Result<CasOutcome, StoreError> {
        Ok(CasOutcome::Conflict)
    }
}

#[tokio::test]
async fn test_exhausted_conflict_retries_fail_the_slot() {
    let h = Harness::new();
    let mut reconciler = rkp::reconciler::PodReconciler::new(
        NODE,
        h.paths.clone(),
        Arc::new(AlwaysConflicts(h.store.clone())),
        Arc::new(h.executor.clone()),
        Arc::new(h.hooks.clone()),
        ReconcilerSettings {
            failure_threshold: 3,
            conflict_retries: 2,
        },
    );
    h.put_intent(&pod("web", "web:1")).await;

    let report = reconciler.reconcile(&h.intent().await).await;
    assert!(report.failed["web"].contains("gave up after 3 attempts"));
    assert!(reconciler.reality().is_empty());
    assert_eq!(reconciler.failures()["web"].attempts, 1);
}

#[tokio::test]
async fn test_store_error_during_write_is_retried_later() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("web", "web:1")).await;
    let snapshot = h.intent().await;

    h.store
        .fail_next(StoreError::Unavailable("connection reset".into()))
        .await;
    let report = reconciler.reconcile(&snapshot).await;
    assert!(report.failed.contains_key("web"));
    assert!(h.reality().await.is_empty());

    // installing an already running pod again is harmless
    let report = reconciler.reconcile(&snapshot).await;
    assert_eq!(report.installed, vec!["web"]);
    assert_eq!(h.reality().await, images(&[("web", "web:1")]));
}

/// Fails the watcher's reads while `faults` is non-zero; writes go through.
struct FlakyReads {
    inner: MemStore,
    faults: AtomicUsize,
}

impl FlakyReads {
    fn check(&self) -> Result<(), StoreError> {
        let left = self.faults.load(Ordering::SeqCst);
        if left > 0 {
            self.faults.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("leader changed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyReads {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        self.check()?;
        self.inner.list(prefix).await
    }

    async fn wait_for_change(&self, prefix: &str, after: i64) -> Result<i64, StoreError> {
        self.check()?;
        self.inner.wait_for_change(prefix, after).await
    }

    async fn put_if(&self, key: &str, value: Vec<u8>, rev: i64) -> Result<CasOutcome, StoreError> {
        self.inner.put_if(key, value, rev).await
    }

    async fn delete_if(&self, key: &str, rev: i64) -> Result<CasOutcome, StoreError> {
        self.inner.delete_if(key, rev).await
    }
}

#[tokio::test]
async fn test_run_converges_through_watch_faults() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    reconciler.bootstrap().await.unwrap();
    let flaky = Arc::new(FlakyReads {
        inner: h.store.clone(),
        faults: AtomicUsize::new(0),
    });
    let (control, handle) = loop_channel("pods");
    let stream = watch(
        flaky.clone(),
        h.paths.intent_path(NODE),
        WatchOptions {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            multiplier: 2,
        },
        control.token(),
    );
    let task = tokio::spawn(reconciler.run(stream, control));

    h.put_intent(&pod("web", "web:1")).await;
    flaky.faults.store(3, Ordering::SeqCst);
    h.put_intent(&pod("db", "db:1")).await;
    h.put_intent(&pod("web", "web:2")).await;

    let converged = eventually(|| async {
        h.reality().await == images(&[("db", "db:1"), ("web", "web:2")])
    })
    .await;
    assert!(converged, "reality: {:?}", h.reality().await);
    assert_eq!(flaky.faults.load(Ordering::SeqCst), 0);

    handle.cancel();
    let reconciler = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reconciler.reality().len(), 2);
    assert_eq!(h.executor.running(), images(&[("db", "db:1"), ("web", "web:2")]));
}

#[tokio::test]
async fn test_other_nodes_are_ignored() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.store
        .put(
            &h.paths.intent_key("node-10", "web"),
            pod("web", "web:1").to_yaml().unwrap(),
        )
        .await;
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report, rkp::reconciler::ReconcileReport {
        revision: report.revision,
        ..Default::default()
    });
    assert!(h.executor.running().is_empty());
}

#[tokio::test]
async fn test_cancelled_reconcile_starts_no_action() {
    let h = Harness::new();
    let mut reconciler = h.reconciler();
    h.put_intent(&pod("a", "a:1")).await;
    h.put_intent(&pod("b", "b:1")).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = reconciler.reconcile_until(&h.intent().await, &cancel).await;
    assert_eq!(report.not_attempted, vec!["a", "b"]);
    assert!(report.installed.is_empty());
    assert!(h.journal.lines().is_empty());
    assert!(h.reality().await.is_empty());

    // nothing was lost: the next notification applies both
    let report = reconciler.reconcile(&h.intent().await).await;
    assert_eq!(report.installed, vec!["a", "b"]);
    assert!(report.not_attempted.is_empty());
}

#[tokio::test]
async fn test_cancel_stops_before_the_next_action() {
    let h = Harness::new();
    h.executor.slow(Duration::from_millis(100));
    for i in 0..5 {
        h.put_intent(&pod(&format!("p{i}"), "img:1")).await;
    }

    let reconciler = h.reconciler();
    let (control, handle) = loop_channel("pods");
    let stream = watch(
        h.shared_store(),
        h.paths.intent_path(NODE),
        WatchOptions::default(),
        control.token(),
    );
    let task = tokio::spawn(reconciler.run(stream, control));

    let journal = h.journal.clone();
    let started = eventually(|| {
        let journal = journal.clone();
        async move { journal.lines().contains(&"install p0".to_string()) }
    })
    .await;
    assert!(started);
    handle.cancel();

    let reconciler = tokio::time::timeout(Duration::from_millis(500), task)
        .await
        .expect("loop did not stop after the action in flight")
        .unwrap();
    let installs: Vec<String> = h
        .journal
        .lines()
        .into_iter()
        .filter(|l| l.starts_with("install"))
        .collect();
    assert_eq!(installs, vec!["install p0"]);
    assert!(!h.journal.lines().iter().any(|l| l.ends_with("p1")));
    // the action in flight was finished and recorded
    assert_eq!(h.reality().await, images(&[("p0", "img:1")]));
    assert_eq!(reconciler.reality().len(), 1);
}
