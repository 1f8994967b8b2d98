use async_trait::async_trait;

use crate::error::StoreError;

/// One key as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last write to this key.
    pub mod_revision: i64,
}

/// Every entry under a prefix, read at a single store revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub prefix: String,
    pub revision: i64,
    pub entries: Vec<KvEntry>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&KvEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write happened; `revision` is the key's new mod revision.
    Applied { revision: i64 },
    /// The key's revision was not the expected one. Nothing was written.
    Conflict,
}

/// The subset of a revisioned, hierarchical key/value store the preparer needs.
///
/// Conditional operations take the key's expected `mod_revision`; `0` means the
/// key must not exist.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Read every key starting with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Snapshot, StoreError>;

    /// Block until a key under `prefix` is written or deleted at a revision
    /// greater than `after_revision`, and return that revision.
    async fn wait_for_change(&self, prefix: &str, after_revision: i64) -> Result<i64, StoreError>;

    async fn put_if(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> Result<CasOutcome, StoreError>;

    async fn delete_if(&self, key: &str, expected_mod_revision: i64)
    -> Result<CasOutcome, StoreError>;
}
