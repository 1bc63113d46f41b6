//! Key-value store contract
//!
//! The engine persists every record as a JSON document under a string key.
//! Each key carries a version assigned by the store; writes may be made
//! conditional on that version (compare-and-set), and a commit applies a
//! batch of writes all-or-nothing.

use async_trait::async_trait;
use serde_json::Value;

use super::StoreError;

/// A stored document and the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
}

/// Precondition attached to a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Unconditional
    Any,
    /// Key must not exist
    Absent,
    /// Key must exist at exactly this version
    Exactly(u64),
}

impl ExpectedVersion {
    /// Version 0 stands for "never stored"
    pub fn from_loaded(version: u64) -> Self {
        if version == 0 {
            ExpectedVersion::Absent
        } else {
            ExpectedVersion::Exactly(version)
        }
    }

    /// Validate against the version currently stored (None when absent)
    pub fn check(&self, key: &str, found: Option<u64>) -> Result<(), StoreError> {
        let ok = match (self, found) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exactly(v), Some(found)) => *v == found,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: self.expected_number(),
                found: found.unwrap_or(0),
            })
        }
    }

    fn expected_number(&self) -> u64 {
        match self {
            ExpectedVersion::Exactly(v) => *v,
            ExpectedVersion::Any | ExpectedVersion::Absent => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    Put(Value),
    Delete,
}

/// One conditional write inside a commit
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub key: String,
    pub action: WriteAction,
    pub expected: ExpectedVersion,
}

impl WriteOp {
    pub fn put(key: impl Into<String>, value: Value, expected: ExpectedVersion) -> Self {
        Self {
            key: key.into(),
            action: WriteAction::Put(value),
            expected,
        }
    }

    pub fn delete(key: impl Into<String>, expected: ExpectedVersion) -> Self {
        Self {
            key: key.into(),
            action: WriteAction::Delete,
            expected,
        }
    }
}

/// Generic persistence used by the engine
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError>;

    /// Apply every write or none of them. Returns the new version of each
    /// written key (0 for deletes), in input order.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        self.compare_and_set(key, value, ExpectedVersion::Any).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        value: Value,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError> {
        let versions = self.commit(vec![WriteOp::put(key, value, expected)]).await?;
        Ok(versions.first().copied().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.commit(vec![WriteOp::delete(key, ExpectedVersion::Any)])
            .await
            .map(|_| ())
    }
}

/// Reject batches that touch a key twice
pub(crate) fn ensure_distinct_keys(ops: &[WriteOp]) -> Result<(), StoreError> {
    let mut seen = std::collections::HashSet::with_capacity(ops.len());
    for op in ops {
        if !seen.insert(op.key.as_str()) {
            return Err(StoreError::DuplicateKey(op.key.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_version_check() {
        assert!(ExpectedVersion::Any.check("k", Some(3)).is_ok());
        assert!(ExpectedVersion::Absent.check("k", None).is_ok());
        assert!(ExpectedVersion::Exactly(3).check("k", Some(3)).is_ok());

        let err = ExpectedVersion::Absent.check("k", Some(3)).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, found: 3, .. }));

        let err = ExpectedVersion::Exactly(2).check("k", None).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 2, found: 0, .. }));
    }

    #[test]
    fn test_from_loaded() {
        assert_eq!(ExpectedVersion::from_loaded(0), ExpectedVersion::Absent);
        assert_eq!(ExpectedVersion::from_loaded(9), ExpectedVersion::Exactly(9));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let ops = vec![
            WriteOp::delete("a", ExpectedVersion::Any),
            WriteOp::delete("a", ExpectedVersion::Any),
        ];
        assert!(matches!(ensure_distinct_keys(&ops), Err(StoreError::DuplicateKey(_))));
    }
}
