//! Audit Log Service
//!
//! Tamper-evident log of admin and money-moving actions. Entries form a
//! SHA-256 hash chain: each entry hashes its own fields together with the
//! previous entry's hash, and `audit:head` always points at the newest one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::OperationContext;
use crate::error::AppError;
use crate::store::{Changeset, ExpectedVersion, Repository, StoreError};

const HEAD_KEY: &str = "audit:head";
const ENTRY_PREFIX: &str = "audit:entry:";
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub sequence_number: u64,
    pub actor_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<Uuid>,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub previous_hash: String,
    pub current_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    fn compute_hash(&self) -> String {
        let hash_input = format!(
            "{}{}{}{}{}{}{}",
            self.id,
            self.sequence_number,
            self.action,
            self.actor_id.map(|u| u.to_string()).unwrap_or_default(),
            self.before_state.as_ref().map(|v| v.to_string()).unwrap_or_default(),
            self.after_state.as_ref().map(|v| v.to_string()).unwrap_or_default(),
            self.previous_hash
        );
        sha256_hex(&hash_input)
    }

    fn key(sequence_number: u64) -> String {
        format!("{}{:020}", ENTRY_PREFIX, sequence_number)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainHead {
    sequence_number: u64,
    hash: String,
}

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ProviderRegistered,
    StageReviewed,
    ProviderUnapproved,
    ProviderBlacklisted,
    BlacklistRemoved,
    ReviewHidden,
    ReviewUnhidden,
    ReviewDeleted,
    BookingSettled,
    WalletCredited,
    WalletDebited,
    PaymentCredited,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ProviderRegistered => "provider.registered",
            AuditAction::StageReviewed => "verification.stage_reviewed",
            AuditAction::ProviderUnapproved => "verification.unapproved",
            AuditAction::ProviderBlacklisted => "provider.blacklisted",
            AuditAction::BlacklistRemoved => "provider.blacklist_removed",
            AuditAction::ReviewHidden => "review.hidden",
            AuditAction::ReviewUnhidden => "review.unhidden",
            AuditAction::ReviewDeleted => "review.deleted",
            AuditAction::BookingSettled => "booking.settled",
            AuditAction::WalletCredited => "wallet.credited",
            AuditAction::WalletDebited => "wallet.debited",
            AuditAction::PaymentCredited => "wallet.payment_credited",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builder for creating audit log entries
#[derive(Debug, Clone)]
pub struct AuditLogBuilder {
    action: AuditAction,
    resource_type: Option<String>,
    resource_id: Option<Uuid>,
    before_state: Option<serde_json::Value>,
    after_state: Option<serde_json::Value>,
}

impl AuditLogBuilder {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            resource_type: None,
            resource_id: None,
            before_state: None,
            after_state: None,
        }
    }

    /// Set the resource type and id
    pub fn resource(mut self, resource_type: &str, resource_id: Uuid) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self.resource_id = Some(resource_id);
        self
    }

    pub fn before_state<T: Serialize>(mut self, state: &T) -> Self {
        self.before_state = serde_json::to_value(state).ok();
        self
    }

    pub fn after_state<T: Serialize>(mut self, state: &T) -> Self {
        self.after_state = serde_json::to_value(state).ok();
        self
    }
}

/// Result of hash chain verification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainVerificationResult {
    pub is_valid: bool,
    pub entries_checked: u64,
    pub first_invalid_entry: Option<Uuid>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
}

impl ChainVerificationResult {
    fn valid(entries_checked: u64) -> Self {
        Self {
            is_valid: true,
            entries_checked,
            first_invalid_entry: None,
            expected_hash: None,
            actual_hash: None,
        }
    }

    fn broken(entries_checked: u64, entry: Option<Uuid>, expected: String, actual: String) -> Self {
        Self {
            is_valid: false,
            entries_checked,
            first_invalid_entry: entry,
            expected_hash: Some(expected),
            actual_hash: Some(actual),
        }
    }
}

/// Audit Log Service
#[derive(Clone)]
pub struct AuditLog {
    repo: Repository,
    clock: std::sync::Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(repo: Repository, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Append an entry at the head of the chain
    pub async fn log(
        &self,
        builder: AuditLogBuilder,
        context: &OperationContext,
    ) -> Result<AuditLogEntry, AppError> {
        let builder = &builder;
        let entry = self
            .repo
            .retry("audit.append", move || self.try_append(builder, context))
            .await?;

        tracing::debug!(
            audit_id = %entry.id,
            sequence = entry.sequence_number,
            action = %entry.action,
            "Audit log entry created"
        );
        Ok(entry)
    }

    /// Append after the audited change already committed. A failure here is
    /// logged, never surfaced to the caller whose operation succeeded.
    pub async fn record(&self, builder: AuditLogBuilder, context: &OperationContext) {
        let action = builder.action;
        if let Err(err) = self.log(builder, context).await {
            tracing::error!(%action, error = %err, "Failed to write audit log entry");
        }
    }

    async fn try_append(
        &self,
        builder: &AuditLogBuilder,
        context: &OperationContext,
    ) -> Result<AuditLogEntry, AppError> {
        let store = self.repo.store();
        let (head, head_version) = match store.get(HEAD_KEY).await? {
            Some(stored) => {
                let head: ChainHead = serde_json::from_value(stored.value).map_err(|e| {
                    StoreError::Corrupt {
                        key: HEAD_KEY.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                (Some(head), stored.version)
            }
            None => (None, 0),
        };

        let (sequence_number, previous_hash) = match head {
            Some(head) => (head.sequence_number + 1, head.hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        let mut entry = AuditLogEntry {
            id: Uuid::new_v4(),
            sequence_number,
            actor_id: context.actor_id(),
            correlation_id: context.correlation_id,
            action: builder.action.as_str().to_string(),
            resource_type: builder.resource_type.clone(),
            resource_id: builder.resource_id,
            before_state: builder.before_state.clone(),
            after_state: builder.after_state.clone(),
            previous_hash,
            current_hash: String::new(),
            created_at: self.clock.now(),
        };
        entry.current_hash = entry.compute_hash();

        let mut changes = Changeset::new();
        changes
            .put(
                HEAD_KEY,
                json!({ "sequence_number": sequence_number, "hash": entry.current_hash }),
                ExpectedVersion::from_loaded(head_version),
            )
            .put(
                AuditLogEntry::key(sequence_number),
                serde_json::to_value(&entry)?,
                ExpectedVersion::Absent,
            );
        self.repo.commit(changes).await?;
        Ok(entry)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Walk the chain from the genesis hash and recompute every entry
    pub async fn verify_hash_chain(&self) -> Result<ChainVerificationResult, AppError> {
        let entries = self.entries().await?;
        let mut previous_hash = GENESIS_HASH.to_string();
        let mut checked = 0u64;

        for entry in &entries {
            checked += 1;
            if entry.previous_hash != previous_hash {
                return Ok(ChainVerificationResult::broken(
                    checked,
                    Some(entry.id),
                    previous_hash,
                    entry.previous_hash.clone(),
                ));
            }

            let calculated = entry.compute_hash();
            if calculated != entry.current_hash {
                return Ok(ChainVerificationResult::broken(
                    checked,
                    Some(entry.id),
                    calculated,
                    entry.current_hash.clone(),
                ));
            }
            previous_hash = entry.current_hash.clone();
        }

        // The head must agree with the last entry, otherwise entries were cut off
        if let Some(stored) = self.repo.store().get(HEAD_KEY).await? {
            let head_hash = stored
                .value
                .get("hash")
                .and_then(|h| h.as_str())
                .unwrap_or_default()
                .to_string();
            if head_hash != previous_hash {
                return Ok(ChainVerificationResult::broken(checked, None, head_hash, previous_hash));
            }
        }

        Ok(ChainVerificationResult::valid(checked))
    }

    /// All entries, oldest first
    pub async fn entries(&self) -> Result<Vec<AuditLogEntry>, AppError> {
        let stored = self.repo.store().list_by_prefix(ENTRY_PREFIX).await?;
        stored
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value.value).map_err(|e| {
                    AppError::from(StoreError::Corrupt {
                        key,
                        reason: e.to_string(),
                    })
                })
            })
            .collect()
    }

    /// Entries touching one resource, newest first
    pub async fn for_resource(&self, resource_id: Uuid) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut entries: Vec<AuditLogEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.resource_id == Some(resource_id))
            .collect();
        entries.reverse();
        Ok(entries)
    }
}

/// Calculate SHA-256 hash and return as hex string
fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::{Identity, Role};
    use crate::store::{MemoryStore, RetryPolicy};
    use std::sync::Arc;

    fn audit() -> (AuditLog, Repository) {
        let repo = Repository::new(Arc::new(MemoryStore::new()), RetryPolicy::new(20));
        (AuditLog::new(repo.clone(), Arc::new(SystemClock)), repo)
    }

    fn admin() -> OperationContext {
        OperationContext::for_caller(Identity::new(Uuid::new_v4(), Role::Admin))
    }

    #[test]
    fn test_audit_action_as_str() {
        assert_eq!(AuditAction::StageReviewed.as_str(), "verification.stage_reviewed");
        assert_eq!(AuditAction::BookingSettled.to_string(), "booking.settled");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex("test input").len(), 64);
    }

    #[tokio::test]
    async fn test_chain_links_entries() {
        let (audit, _) = audit();
        let provider = Uuid::new_v4();

        let first = audit
            .log(
                AuditLogBuilder::new(AuditAction::ProviderBlacklisted)
                    .resource("provider", provider)
                    .after_state(&serde_json::json!({"reason": "fraud"})),
                &admin(),
            )
            .await
            .unwrap();
        let second = audit
            .log(
                AuditLogBuilder::new(AuditAction::BlacklistRemoved).resource("provider", provider),
                &admin(),
            )
            .await
            .unwrap();

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.current_hash);
        assert_eq!(second.sequence_number, 2);

        let result = audit.verify_hash_chain().await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.entries_checked, 2);
        assert_eq!(audit.for_resource(provider).await.unwrap()[0].id, second.id);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let (audit, repo) = audit();
        for _ in 0..3 {
            audit
                .log(AuditLogBuilder::new(AuditAction::WalletCredited), &admin())
                .await
                .unwrap();
        }

        let key = AuditLogEntry::key(2);
        let mut entry: AuditLogEntry =
            serde_json::from_value(repo.store().get(&key).await.unwrap().unwrap().value).unwrap();
        entry.action = AuditAction::WalletDebited.as_str().to_string();
        repo.store()
            .set(&key, serde_json::to_value(&entry).unwrap())
            .await
            .unwrap();

        let result = audit.verify_hash_chain().await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.first_invalid_entry, Some(entry.id));
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_chain_intact() {
        let (audit, _) = audit();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let audit = audit.clone();
            handles.push(tokio::spawn(async move {
                audit
                    .log(AuditLogBuilder::new(AuditAction::ReviewHidden), &admin())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let result = audit.verify_hash_chain().await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.entries_checked, 8);
    }
}
