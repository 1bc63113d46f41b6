//! Record Repository
//!
//! Typed access to the key-value store. Records are JSON documents that
//! carry a store-assigned version; every write is a compare-and-set on the
//! version that was read, and secondary index entries are written in the
//! same atomic commit as the record they point to.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::AppError;

use super::kv::{ExpectedVersion, KvStore, WriteOp};
use super::StoreError;

/// A persisted entity
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key namespace, e.g. `booking`
    const KIND: &'static str;

    fn record_id(&self) -> Uuid;

    /// Secondary index keys this record should currently appear under
    fn index_keys(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn key_for(id: Uuid) -> String {
        format!("{}:{}", Self::KIND, id)
    }
}

/// A record together with the version it was read at (0 = not yet stored)
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub record: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    /// A record that has never been stored
    pub fn fresh(record: T) -> Self {
        Self { record, version: 0 }
    }

    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// Writes that must land together
#[derive(Debug, Default)]
pub struct Changeset {
    ops: Vec<WriteOp>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `updated` over `original`, conditional on the version `original`
    /// was read at, and move index entries to match.
    pub fn save<T: Record>(&mut self, original: &Versioned<T>, updated: &T) -> Result<&mut Self, StoreError> {
        let id = updated.record_id();
        self.ops.push(WriteOp::put(
            T::key_for(id),
            serde_json::to_value(updated)?,
            ExpectedVersion::from_loaded(original.version),
        ));

        let before = if original.is_new() {
            BTreeSet::new()
        } else {
            original.record.index_keys()
        };
        let after = updated.index_keys();

        for stale in before.difference(&after) {
            self.ops.push(WriteOp::delete(stale.clone(), ExpectedVersion::Any));
        }
        for added in after.difference(&before) {
            self.ops
                .push(WriteOp::put(added.clone(), json!({ "id": id }), ExpectedVersion::Any));
        }
        Ok(self)
    }

    /// Create a record that must not already exist
    pub fn insert<T: Record>(&mut self, record: &T) -> Result<&mut Self, StoreError> {
        self.save(&Versioned::fresh(record.clone()), record)
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value, expected: ExpectedVersion) -> &mut Self {
        self.ops.push(WriteOp::put(key, value, expected));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>, expected: ExpectedVersion) -> &mut Self {
        self.ops.push(WriteOp::delete(key, expected));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Bounded retry for optimistic-lock losses
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Linear backoff with jitter so racing writers spread out
    async fn backoff(&self, attempt: u32) {
        let base = self.base_delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base);
        let delay = Duration::from_millis(base * attempt as u64 + jitter);
        tokio::time::sleep(delay).await;
    }
}

#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn KvStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("retry", &self.retry).finish()
    }
}

impl Repository {
    pub fn new(store: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn load<T: Record>(&self, id: Uuid) -> Result<Option<Versioned<T>>, AppError> {
        let key = T::key_for(id);
        match self.store.get(&key).await? {
            Some(stored) => {
                let record = decode::<T>(&key, stored.value)?;
                Ok(Some(Versioned {
                    record,
                    version: stored.version,
                }))
            }
            None => Ok(None),
        }
    }

    /// Load or fail with `NotFound`
    pub async fn require<T: Record>(&self, id: Uuid) -> Result<Versioned<T>, AppError> {
        self.load(id)
            .await?
            .ok_or_else(|| AppError::not_found(T::KIND, id))
    }

    /// Load, or start from `init` at version 0 when absent
    pub async fn load_or_else<T, I>(&self, id: Uuid, init: I) -> Result<Versioned<T>, AppError>
    where
        T: Record,
        I: FnOnce() -> T,
    {
        Ok(self
            .load(id)
            .await?
            .unwrap_or_else(|| Versioned::fresh(init())))
    }

    /// Records listed under an index prefix. Entries pointing at a missing
    /// record are skipped; callers re-check predicates on the record itself.
    pub async fn find_indexed<T: Record>(&self, prefix: &str) -> Result<Vec<Versioned<T>>, AppError> {
        let entries = self.store.list_by_prefix(prefix).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let id = entry
                .value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.clone(),
                    reason: "index entry without id".to_string(),
                })?;
            if let Some(record) = self.load::<T>(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// All records of a kind (full scan)
    pub async fn scan<T: Record>(&self) -> Result<Vec<Versioned<T>>, AppError> {
        let prefix = format!("{}:", T::KIND);
        let entries = self.store.list_by_prefix(&prefix).await?;
        entries
            .into_iter()
            .map(|(key, stored)| {
                Ok(Versioned {
                    record: decode::<T>(&key, stored.value)?,
                    version: stored.version,
                })
            })
            .collect()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a changeset atomically
    pub async fn commit(&self, changes: Changeset) -> Result<(), AppError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.store.commit(changes.into_ops()).await?;
        Ok(())
    }

    /// Create a new record; `Conflict` if the id is taken
    pub async fn insert<T: Record>(&self, record: &T) -> Result<(), AppError> {
        let mut changes = Changeset::new();
        changes.insert(record)?;
        self.commit(changes).await.map_err(|err| {
            if err.is_retryable() {
                AppError::Conflict(format!("{} {} already exists", T::KIND, record.record_id()))
            } else {
                err
            }
        })
    }

    /// Read-modify-write on one existing record with bounded retry
    pub async fn update<T, R, F>(&self, id: Uuid, mut mutate: F) -> Result<(T, R), AppError>
    where
        T: Record,
        F: FnMut(&mut T) -> Result<R, AppError>,
    {
        let max = self.retry.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.require::<T>(id).await?;
            let mut updated = current.record.clone();
            let output = mutate(&mut updated)?;

            let mut changes = Changeset::new();
            changes.save(&current, &updated)?;
            match self.commit(changes).await {
                Ok(()) => return Ok((updated, output)),
                Err(err) if err.is_retryable() => {
                    if attempt >= max {
                        return Err(exhausted(T::KIND, max));
                    }
                    tracing::warn!(
                        kind = T::KIND,
                        %id,
                        attempt,
                        max_attempts = max,
                        "Version conflict, retrying"
                    );
                    self.retry.backoff(attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like `update`, but creates the record from `init` when absent
    pub async fn upsert<T, R, I, F>(&self, id: Uuid, init: I, mut mutate: F) -> Result<(T, R), AppError>
    where
        T: Record,
        I: Fn() -> T,
        F: FnMut(&mut T) -> Result<R, AppError>,
    {
        let max = self.retry.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load_or_else::<T, _>(id, &init).await?;
            let mut updated = current.record.clone();
            let output = mutate(&mut updated)?;

            let mut changes = Changeset::new();
            changes.save(&current, &updated)?;
            match self.commit(changes).await {
                Ok(()) => return Ok((updated, output)),
                Err(err) if err.is_retryable() => {
                    if attempt >= max {
                        return Err(exhausted(T::KIND, max));
                    }
                    tracing::warn!(kind = T::KIND, %id, attempt, "Version conflict, retrying");
                    self.retry.backoff(attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Re-run a whole multi-record read-modify-write while it loses
    /// optimistic-lock races. The closure must re-read everything it writes.
    pub async fn retry<T, F, Fut>(&self, operation: &'static str, mut attempt_fn: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max = self.retry.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Err(err) if err.is_retryable() => {
                    if attempt >= max {
                        return Err(exhausted(operation, max));
                    }
                    tracing::warn!(operation, attempt, max_attempts = max, "Version conflict, retrying");
                    self.retry.backoff(attempt).await;
                }
                other => return other,
            }
        }
    }
}

fn decode<T: Record>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn exhausted(what: &str, attempts: u32) -> AppError {
    AppError::Conflict(format!(
        "{} lost to concurrent modification after {} attempts",
        what, attempts
    ))
}
