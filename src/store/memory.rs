//! In-memory store
//!
//! Used by tests and by deployments without `DATABASE_URL`. A single global
//! revision counter hands out versions, so a key that is deleted and written
//! again never reuses an old version.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::kv::{ensure_distinct_keys, KvStore, VersionedValue, WriteAction, WriteOp};
use super::StoreError;

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, VersionedValue>,
    revision: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        Ok(self.inner.read().await.entries.get(key).cloned())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>, StoreError> {
        ensure_distinct_keys(&ops)?;

        let mut inner = self.inner.write().await;

        // Validate every precondition before touching anything
        for op in &ops {
            let found = inner.entries.get(&op.key).map(|v| v.version);
            op.expected.check(&op.key, found)?;
        }

        let mut versions = Vec::with_capacity(ops.len());
        for op in ops {
            match op.action {
                WriteAction::Put(value) => {
                    inner.revision += 1;
                    let version = inner.revision;
                    inner.entries.insert(op.key, VersionedValue { value, version });
                    versions.push(version);
                }
                WriteAction::Delete => {
                    inner.entries.remove(&op.key);
                    versions.push(0);
                }
            }
        }

        Ok(versions)
    }
}
