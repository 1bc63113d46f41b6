//! PostgreSQL store
//!
//! Backs the key-value contract with a single `kv_records` table. Versions
//! come from the `kv_revision_seq` sequence. Conditional writes are expressed
//! as guarded statements inside one transaction, so a lost race shows up as
//! zero affected rows rather than a lock timeout.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use super::kv::{ensure_distinct_keys, ExpectedVersion, KvStore, VersionedValue, WriteAction, WriteOp};
use super::StoreError;

#[derive(Debug, Clone)]
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
    ) -> Result<u64, StoreError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM kv_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(version.map(to_version).unwrap_or(0))
    }

    async fn conflict(
        tx: &mut Transaction<'_, Postgres>,
        op: &WriteOp,
    ) -> Result<StoreError, StoreError> {
        let found = Self::current_version(tx, &op.key).await?;
        Ok(StoreError::VersionConflict {
            key: op.key.clone(),
            expected: match op.expected {
                ExpectedVersion::Exactly(v) => v,
                _ => 0,
            },
            found,
        })
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, op: &WriteOp) -> Result<Option<u64>, StoreError> {
        let version = match (&op.action, op.expected) {
            (WriteAction::Put(value), ExpectedVersion::Any) => {
                Some(Self::upsert(tx, &op.key, value).await?)
            }
            (WriteAction::Put(value), ExpectedVersion::Absent) => {
                let version: Option<i64> = sqlx::query_scalar(
                    r#"
                    INSERT INTO kv_records (key, value, version)
                    VALUES ($1, $2, nextval('kv_revision_seq'))
                    ON CONFLICT (key) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(&op.key)
                .bind(value)
                .fetch_optional(&mut **tx)
                .await?;
                version.map(to_version)
            }
            (WriteAction::Put(value), ExpectedVersion::Exactly(expected)) => {
                let version: Option<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE kv_records
                    SET value = $2, version = nextval('kv_revision_seq'), updated_at = NOW()
                    WHERE key = $1 AND version = $3
                    RETURNING version
                    "#,
                )
                .bind(&op.key)
                .bind(value)
                .bind(expected as i64)
                .fetch_optional(&mut **tx)
                .await?;
                version.map(to_version)
            }
            (WriteAction::Delete, ExpectedVersion::Any) => {
                sqlx::query("DELETE FROM kv_records WHERE key = $1")
                    .bind(&op.key)
                    .execute(&mut **tx)
                    .await?;
                Some(0)
            }
            (WriteAction::Delete, ExpectedVersion::Absent) => {
                let exists = Self::current_version(tx, &op.key).await? != 0;
                (!exists).then_some(0)
            }
            (WriteAction::Delete, ExpectedVersion::Exactly(expected)) => {
                let result = sqlx::query("DELETE FROM kv_records WHERE key = $1 AND version = $2")
                    .bind(&op.key)
                    .bind(expected as i64)
                    .execute(&mut **tx)
                    .await?;
                (result.rows_affected() == 1).then_some(0)
            }
        };
        Ok(version)
    }

    async fn upsert(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        value: &Value,
    ) -> Result<u64, StoreError> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO kv_records (key, value, version)
            VALUES ($1, $2, nextval('kv_revision_seq'))
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, version = EXCLUDED.version, updated_at = NOW()
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_one(&mut **tx)
        .await?;
        Ok(to_version(version))
    }
}

fn to_version(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

/// Smallest string greater than every string starting with `prefix`, in
/// code point order. `None` when no such bound exists (empty prefix, or one
/// made only of `char::MAX`).
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = u32::from(last) + 1;
        // Skip the surrogate gap
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(bumped) = char::from_u32(next) {
            chars.push(bumped);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        let row: Option<(Value, i64)> =
            sqlx::query_as("SELECT value, version FROM kv_records WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(value, version)| VersionedValue {
            value,
            version: to_version(version),
        }))
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        // Range bounds in byte order so the planner can walk the "C" collated key index
        let rows: Vec<(String, Value, i64)> = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query_as(
                    r#"
                    SELECT key, value, version
                    FROM kv_records
                    WHERE key COLLATE "C" >= $1 AND key COLLATE "C" < $2
                    ORDER BY key COLLATE "C" ASC
                    "#,
                )
                .bind(prefix)
                .bind(upper)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT key, value, version
                    FROM kv_records
                    WHERE key COLLATE "C" >= $1
                    ORDER BY key COLLATE "C" ASC
                    "#,
                )
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(key, value, version)| {
                (
                    key,
                    VersionedValue {
                        value,
                        version: to_version(version),
                    },
                )
            })
            .collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>, StoreError> {
        ensure_distinct_keys(&ops)?;

        let mut tx = self.pool.begin().await?;
        let mut versions = Vec::with_capacity(ops.len());

        for op in &ops {
            match Self::apply(&mut tx, op).await? {
                Some(version) => versions.push(version),
                None => {
                    let err = Self::conflict(&mut tx, op).await?;
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }

        tx.commit().await?;
        Ok(versions)
    }
}

// =========================================================================
// Tests (require a database; run with `cargo test -- --ignored`)
// =========================================================================
