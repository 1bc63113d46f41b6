//! Provider availability sync
//!
//! Accept, completion and cancellation change a provider's `available`
//! flag after the booking itself has committed. That second write is best
//! effort: when it fails, the desired value is parked in an outbox entry and
//! the scheduler applies it later. The newest desired value per provider
//! wins, and every direct availability write deletes the queued entry in
//! the same commit, so a drain never replays an older value over it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::Provider;
use crate::error::AppError;
use crate::store::{Changeset, ExpectedVersion, Repository, StoreError};

const OUTBOX_PREFIX: &str = "outbox:availability:";

/// Pending availability change for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityChange {
    pub provider_id: Uuid,
    pub available: bool,
    pub reason: String,
    pub queued_at: DateTime<Utc>,
}

/// Result of applying one change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// Provider went away or is no longer eligible to be released
    Dropped,
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct AvailabilitySync {
    repo: Repository,
    clock: Arc<dyn Clock>,
}

impl AvailabilitySync {
    pub fn new(repo: Repository, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    fn outbox_key(provider_id: Uuid) -> String {
        format!("{}{}", OUTBOX_PREFIX, provider_id)
    }

    /// Add the removal of any queued change for `provider_id` to a changeset
    /// that writes the provider's availability directly
    pub fn supersede_queued(changes: &mut Changeset, provider_id: Uuid) {
        changes.delete(Self::outbox_key(provider_id), ExpectedVersion::Any);
    }

    /// Write the flag now, or queue it when the write fails
    pub async fn apply_or_queue(&self, provider_id: Uuid, available: bool, reason: &str) -> SyncOutcome {
        match self.apply(provider_id, available, ExpectedVersion::Any).await {
            Ok(outcome) => outcome.unwrap_or(SyncOutcome::Applied),
            Err(err) => {
                tracing::warn!(
                    %provider_id,
                    available,
                    reason,
                    error = %err,
                    "Availability update failed, queueing for retry"
                );
                if let Err(queue_err) = self.enqueue(provider_id, available, reason).await {
                    tracing::error!(
                        %provider_id,
                        error = %queue_err,
                        "Failed to queue availability update"
                    );
                }
                SyncOutcome::Queued
            }
        }
    }

    /// Write the flag and remove the outbox entry in one commit. `queued` is
    /// the outbox entry version being applied, or `Any` for a direct write.
    /// `None` when the entry was replaced by a newer one before it could be
    /// applied.
    async fn apply(
        &self,
        provider_id: Uuid,
        available: bool,
        queued: ExpectedVersion,
    ) -> Result<Option<SyncOutcome>, AppError> {
        self.repo
            .retry("availability.apply", || async move {
                let key = Self::outbox_key(provider_id);
                if let ExpectedVersion::Exactly(version) = queued {
                    let current = self.repo.store().get(&key).await?.map(|entry| entry.version);
                    if current != Some(version) {
                        return Ok(None);
                    }
                }

                let mut changes = Changeset::new();
                changes.delete(key, queued);
                let outcome = match self.repo.load::<Provider>(provider_id).await? {
                    None => SyncOutcome::Dropped,
                    Some(loaded) if loaded.record.available == available => SyncOutcome::Applied,
                    Some(loaded) => {
                        let mut provider = loaded.record.clone();
                        match provider.set_available(available, self.clock.now()) {
                            Ok(()) => {
                                changes.save(&loaded, &provider)?;
                                SyncOutcome::Applied
                            }
                            // Releasing a provider that lost eligibility in the meantime
                            Err(_) => SyncOutcome::Dropped,
                        }
                    }
                };
                self.repo.commit(changes).await?;
                Ok(Some(outcome))
            })
            .await
    }

    pub async fn enqueue(&self, provider_id: Uuid, available: bool, reason: &str) -> Result<(), AppError> {
        let change = AvailabilityChange {
            provider_id,
            available,
            reason: reason.to_string(),
            queued_at: self.clock.now(),
        };
        self.repo
            .store()
            .set(&Self::outbox_key(provider_id), serde_json::to_value(&change)?)
            .await?;
        Ok(())
    }

    pub async fn pending(&self) -> Result<Vec<AvailabilityChange>, AppError> {
        let entries = self.repo.store().list_by_prefix(OUTBOX_PREFIX).await?;
        entries
            .into_iter()
            .map(|(key, stored)| {
                serde_json::from_value(stored.value).map_err(|e| {
                    AppError::from(StoreError::Corrupt {
                        key,
                        reason: e.to_string(),
                    })
                })
            })
            .collect()
    }

    /// Apply every queued change. An entry is removed only if nobody queued
    /// or superseded it while it was being applied.
    pub async fn drain(&self) -> Result<DrainReport, AppError> {
        let mut report = DrainReport::default();
        let entries = self.repo.store().list_by_prefix(OUTBOX_PREFIX).await?;

        for (key, stored) in entries {
            let change: AvailabilityChange = match serde_json::from_value(stored.value) {
                Ok(change) => change,
                Err(e) => {
                    tracing::error!(%key, error = %e, "Discarding unreadable outbox entry");
                    self.repo.store().delete(&key).await?;
                    report.dropped += 1;
                    continue;
                }
            };

            let queued = ExpectedVersion::Exactly(stored.version);
            match self.apply(change.provider_id, change.available, queued).await {
                Ok(Some(SyncOutcome::Dropped)) => report.dropped += 1,
                Ok(Some(_)) => report.applied += 1,
                Ok(None) => {
                    tracing::debug!(%key, "Outbox entry replaced while draining");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        provider_id = %change.provider_id,
                        error = %err,
                        "Availability retry failed, leaving queued"
                    );
                }
            }
        }

        if report.applied + report.dropped > 0 {
            tracing::info!(
                applied = report.applied,
                dropped = report.dropped,
                failed = report.failed,
                "Drained availability outbox"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::VerificationOutcome;
    use crate::store::{MemoryStore, RetryPolicy};
    use rust_decimal_macros::dec;

    fn setup() -> (AvailabilitySync, Repository) {
        let repo = Repository::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
        (AvailabilitySync::new(repo.clone(), Arc::new(SystemClock)), repo)
    }

    async fn approved_provider(repo: &Repository) -> Uuid {
        let now = Utc::now();
        let mut provider = Provider::new(Uuid::new_v4(), "Asha".to_string(), vec![], None, dec!(300), now);
        provider.apply_verification_outcome(VerificationOutcome::Approved, now);
        repo.insert(&provider).await.unwrap();
        provider.id
    }

    #[tokio::test]
    async fn test_queued_change_is_drained() {
        let (sync, repo) = setup();
        let provider_id = approved_provider(&repo).await;

        sync.enqueue(provider_id, true, "booking completed").await.unwrap();
        assert_eq!(sync.pending().await.unwrap().len(), 1);

        let report = sync.drain().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(sync.pending().await.unwrap().is_empty());
        assert!(repo.require::<Provider>(provider_id).await.unwrap().record.available);
    }

    #[tokio::test]
    async fn test_direct_write_supersedes_queued_change() {
        let (sync, repo) = setup();
        let provider_id = approved_provider(&repo).await;

        sync.enqueue(provider_id, false, "accepted booking").await.unwrap();
        assert_eq!(
            sync.apply_or_queue(provider_id, true, "booking cancelled").await,
            SyncOutcome::Applied
        );
        assert!(sync.pending().await.unwrap().is_empty());

        let report = sync.drain().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(repo.require::<Provider>(provider_id).await.unwrap().record.available);
    }

    #[tokio::test]
    async fn test_changeset_supersede_removes_entry() {
        let (sync, repo) = setup();
        let provider_id = approved_provider(&repo).await;
        sync.enqueue(provider_id, false, "accepted booking").await.unwrap();

        let loaded = repo.require::<Provider>(provider_id).await.unwrap();
        let mut provider = loaded.record.clone();
        provider.set_available(true, Utc::now()).unwrap();
        let mut changes = Changeset::new();
        changes.save(&loaded, &provider).unwrap();
        AvailabilitySync::supersede_queued(&mut changes, provider_id);
        repo.commit(changes).await.unwrap();

        assert!(sync.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_of_ineligible_provider_is_dropped() {
        let (sync, repo) = setup();
        let now = Utc::now();
        let provider = Provider::new(Uuid::new_v4(), "Ravi".to_string(), vec![], None, dec!(300), now);
        repo.insert(&provider).await.unwrap();

        assert_eq!(
            sync.apply_or_queue(provider.id, true, "booking completed").await,
            SyncOutcome::Dropped
        );
        assert_eq!(
            sync.apply_or_queue(Uuid::new_v4(), false, "accepted").await,
            SyncOutcome::Dropped
        );
    }
}
