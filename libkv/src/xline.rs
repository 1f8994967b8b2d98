use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, Txn, TxnOp,
    WatchOptions as EtcdWatchOptions,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    store::{CasOutcome, KvEntry, KvStore, Snapshot},
};

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    /// Root of the preparer's keys; the caller supplies a default when unset.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// [`KvStore`] backed by an Xline (or etcd v3) cluster.
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<Mutex<Client>>,
}

impl XlineStore {
    pub async fn connect(config: &XlineConfig) -> Result<Self, StoreError> {
        if config.endpoints.is_empty() {
            return Err(StoreError::Invalid(
                "no xline endpoints configured".to_string(),
            ));
        }
        let opts = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                Some(ConnectOptions::new().with_user(user.clone(), pass.clone()))
            }
            _ => None,
        };
        let client = Client::connect(&config.endpoints, opts).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Unconditional write.
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<i64, StoreError> {
        let mut client = self.client.lock().await;
        let resp = client.put(key, value.into(), None).await?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    /// Unconditional delete of `key`, or of every key under it when `prefix`
    /// is set.
    pub async fn delete(&self, key: &str, prefix: bool) -> Result<i64, StoreError> {
        let opts = prefix.then(|| DeleteOptions::new().with_prefix());
        let mut client = self.client.lock().await;
        let resp = client.delete(key, opts).await?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    async fn cas(
        &self,
        key: &str,
        expected_mod_revision: i64,
        op: TxnOp,
    ) -> Result<CasOutcome, StoreError> {
        let cmp = if expected_mod_revision == 0 {
            Compare::version(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected_mod_revision)
        };
        let txn = Txn::new().when([cmp]).and_then([op]);
        let resp = self.client.lock().await.txn(txn).await?;
        if !resp.succeeded() {
            debug!(key, expected_mod_revision, "conditional write lost the race");
            return Ok(CasOutcome::Conflict);
        }
        let revision = resp.header().map_or(0, |h| h.revision());
        Ok(CasOutcome::Applied { revision })
    }
}

#[async_trait]
impl KvStore for XlineStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let resp = self.client.lock().await.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KvEntry {
            key: String::from_utf8_lossy(kv.key()).to_string(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        let resp = self
            .client
            .lock()
            .await
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let mut entries: Vec<KvEntry> = resp
            .kvs()
            .iter()
            .map(|kv| KvEntry {
                key: String::from_utf8_lossy(kv.key()).to_string(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Snapshot {
            prefix: prefix.to_string(),
            revision,
            entries,
        })
    }

    async fn wait_for_change(&self, prefix: &str, after_revision: i64) -> Result<i64, StoreError> {
        let opts = EtcdWatchOptions::new()
            .with_prefix()
            .with_start_revision(after_revision + 1);
        // The watcher must stay alive while we read the stream; dropping it
        // cancels the watch on the server.
        let (_watcher, mut stream) = {
            let mut client = self.client.lock().await;
            client.watch(prefix, Some(opts)).await?
        };

        loop {
            let resp = match stream.message().await? {
                Some(resp) => resp,
                None => {
                    return Err(StoreError::Unavailable(format!(
                        "watch stream on {prefix} closed"
                    )));
                }
            };
            if resp.compact_revision() > 0 {
                return Err(StoreError::Compacted {
                    requested: after_revision + 1,
                    compacted: resp.compact_revision(),
                });
            }
            if resp.canceled() {
                warn!(prefix, "xline watch channel canceled by server");
                return Err(StoreError::Unavailable(format!(
                    "watch on {prefix} canceled by server"
                )));
            }
            // The first response only confirms the watch was created.
            if let Some(rev) = resp
                .events()
                .iter()
                .filter_map(|e| e.kv())
                .map(|kv| kv.mod_revision())
                .max()
            {
                return Ok(rev);
            }
        }
    }

    async fn put_if(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> Result<CasOutcome, StoreError> {
        self.cas(key, expected_mod_revision, TxnOp::put(key, value, None))
            .await
    }

    async fn delete_if(
        &self,
        key: &str,
        expected_mod_revision: i64,
    ) -> Result<CasOutcome, StoreError> {
        self.cas(key, expected_mod_revision, TxnOp::delete(key, None))
            .await
    }
}
