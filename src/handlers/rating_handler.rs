//! Rating Handler
//!
//! Client reviews and the provider rating aggregate. The aggregate is
//! recomputed from the provider's bookings after every rating change; the
//! provider is always committed at the version read before the scan, even
//! when the numbers did not move, so any recompute that overlapped a later
//! one loses its compare-and-set and rescans.

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogBuilder};
use crate::domain::{Booking, OperationContext, Provider, RatingChange, Role};
use crate::error::AppError;
use crate::projection::MarketplaceIndex;
use crate::store::Changeset;

use super::deps::{acting_as, HandlerDeps};
use super::{RateCommand, RatingResult};

// =========================================================================
// RatingHandler
// =========================================================================

pub struct RatingHandler {
    deps: HandlerDeps,
}

impl RatingHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    /// Create or edit the client's review of a completed booking
    pub async fn rate(
        &self,
        client_id: Uuid,
        booking_id: Uuid,
        command: RateCommand,
        context: &OperationContext,
    ) -> Result<RatingResult, AppError> {
        acting_as(context, Role::Client, client_id)?;
        let text = command
            .review
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let window = self.deps.settings.rating_edit_window;
        let now = self.deps.clock.now();

        let (booking, change) = self
            .deps
            .repo
            .update::<Booking, _, _>(booking_id, |booking| {
                booking
                    .rate(client_id, command.rating, text.clone(), window, now)
                    .map_err(AppError::from)
            })
            .await?;
        let provider_id = assigned_provider(&booking)?;

        // The review is already stored; a lost aggregate race is repaired by
        // the next recompute for this provider
        let provider = match self.recompute(provider_id).await {
            Ok(provider) => provider,
            Err(err) => {
                tracing::warn!(
                    %booking_id,
                    %provider_id,
                    error = %err,
                    "Rating saved but aggregate recompute failed"
                );
                self.deps.repo.require::<Provider>(provider_id).await?.record
            }
        };
        tracing::info!(
            %booking_id,
            %provider_id,
            rating = command.rating,
            edited = change == RatingChange::Edited,
            provider_rating = %provider.rating,
            "Booking rated"
        );
        Ok(RatingResult::new(booking_id, change == RatingChange::Edited, &provider))
    }

    /// Rebuild a provider's rating from every visible review on their bookings
    pub async fn recompute(&self, provider_id: Uuid) -> Result<Provider, AppError> {
        self.deps
            .repo
            .retry("rating.recompute", || async move {
                let loaded = self.deps.repo.require::<Provider>(provider_id).await?;

                let ratings: Vec<u8> = self
                    .deps
                    .repo
                    .provider_bookings(provider_id)
                    .await?
                    .into_iter()
                    .filter(|b| b.record.provider_id == Some(provider_id))
                    .filter_map(|b| b.record.visible_rating())
                    .collect();
                let count = ratings.len() as u32;
                let mean = if count == 0 {
                    Decimal::ZERO
                } else {
                    let sum: u32 = ratings.iter().map(|r| u32::from(*r)).sum();
                    Decimal::from(sum) / Decimal::from(count)
                };

                let mut provider = loaded.record.clone();
                provider.set_rating(mean, count, self.deps.clock.now());

                let mut changes = Changeset::new();
                changes.save(&loaded, &provider)?;
                self.deps.repo.commit(changes).await?;
                Ok(provider)
            })
            .await
    }

    // =========================================================================
    // Moderation (admin)
    // =========================================================================

    pub async fn hide_review(&self, booking_id: Uuid, context: &OperationContext) -> Result<RatingResult, AppError> {
        self.set_hidden(booking_id, true, context).await
    }

    pub async fn unhide_review(&self, booking_id: Uuid, context: &OperationContext) -> Result<RatingResult, AppError> {
        self.set_hidden(booking_id, false, context).await
    }

    async fn set_hidden(
        &self,
        booking_id: Uuid,
        hidden: bool,
        context: &OperationContext,
    ) -> Result<RatingResult, AppError> {
        context.require_admin()?;
        let now = self.deps.clock.now();

        let (booking, changed) = self
            .deps
            .repo
            .update::<Booking, _, _>(booking_id, |booking| {
                booking
                    .set_review_hidden(hidden, now)
                    .ok_or_else(|| AppError::not_found("review", booking_id))
            })
            .await?;
        let provider_id = assigned_provider(&booking)?;
        let provider = self.recompute(provider_id).await?;

        if changed {
            tracing::info!(%booking_id, %provider_id, hidden, "Review visibility changed");
            let action = if hidden {
                AuditAction::ReviewHidden
            } else {
                AuditAction::ReviewUnhidden
            };
            self.deps
                .audit
                .record(
                    AuditLogBuilder::new(action)
                        .resource("review", booking_id)
                        .after_state(&booking.review),
                    context,
                )
                .await;
        }

        Ok(RatingResult::new(booking_id, false, &provider))
    }

    /// Remove a review and take it out of the aggregate incrementally. A
    /// hidden review never counted, so the aggregate is left alone.
    pub async fn delete_review(&self, booking_id: Uuid, context: &OperationContext) -> Result<RatingResult, AppError> {
        context.require_admin()?;

        let (removed, provider) = self
            .deps
            .repo
            .retry("rating.delete_review", || async move {
                let now = self.deps.clock.now();
                let loaded = self.deps.repo.require::<Booking>(booking_id).await?;
                let mut booking = loaded.record.clone();
                let removed = booking
                    .remove_review(now)
                    .ok_or_else(|| AppError::not_found("review", booking_id))?;
                let provider_id = assigned_provider(&booking)?;

                let loaded_provider = self.deps.repo.require::<Provider>(provider_id).await?;
                let mut provider = loaded_provider.record.clone();

                let mut changes = Changeset::new();
                changes.save(&loaded, &booking)?;
                if !removed.hidden {
                    provider.remove_rating(removed.rating, now);
                    changes.save(&loaded_provider, &provider)?;
                }
                self.deps.repo.commit(changes).await?;
                Ok((removed, provider))
            })
            .await?;

        tracing::info!(
            %booking_id,
            provider_id = %provider.id,
            rating = removed.rating,
            was_hidden = removed.hidden,
            "Review deleted"
        );
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::ReviewDeleted)
                    .resource("review", booking_id)
                    .before_state(&removed),
                context,
            )
            .await;

        Ok(RatingResult::new(booking_id, false, &provider))
    }
}

fn assigned_provider(booking: &Booking) -> Result<Uuid, AppError> {
    booking.provider_id.ok_or_else(|| {
        AppError::Internal(format!("reviewed booking {} has no provider", booking.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineSettings;
    use crate::domain::{BookingStatus, Identity};
    use crate::error::ErrorKind;
    use crate::store::{KvStore, MemoryStore, StoreError, VersionedValue, WriteOp};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Memory store that can hold the next provider commit until released,
    /// or reject every provider commit as a lost race
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryStore,
        hold_next: AtomicBool,
        always_conflict: AtomicBool,
        held: Notify,
        release: Notify,
    }

    #[async_trait]
    impl KvStore for ContendedStore {
        async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
            self.inner.get(key).await
        }

        async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
            self.inner.list_by_prefix(prefix).await
        }

        async fn commit(&self, ops: Vec<WriteOp>) -> Result<Vec<u64>, StoreError> {
            if let Some(op) = ops.iter().find(|op| op.key.starts_with("provider:")) {
                if self.always_conflict.load(Ordering::SeqCst) {
                    return Err(StoreError::VersionConflict {
                        key: op.key.clone(),
                        expected: 1,
                        found: 2,
                    });
                }
                if self.hold_next.swap(false, Ordering::SeqCst) {
                    self.held.notify_one();
                    self.release.notified().await;
                }
            }
            self.inner.commit(ops).await
        }
    }

    struct Fixture {
        deps: HandlerDeps,
        clock: Arc<ManualClock>,
        handler: RatingHandler,
        provider: Uuid,
        admin: OperationContext,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_store(Arc::new(MemoryStore::new())).await
        }

        async fn with_store(store: Arc<dyn KvStore>) -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let deps = HandlerDeps::new(store, clock.clone(), EngineSettings::default());
            let provider = Provider::new(
                Uuid::new_v4(),
                "Asha".to_string(),
                vec![],
                None,
                dec!(350),
                Utc::now(),
            );
            deps.repo.insert(&provider).await.unwrap();
            Self {
                handler: RatingHandler::new(deps.clone()),
                deps,
                clock,
                provider: provider.id,
                admin: OperationContext::for_caller(Identity::new(Uuid::new_v4(), Role::Admin)),
            }
        }

        /// A completed booking for a fresh client
        async fn completed(&self) -> (Uuid, Uuid) {
            let client = Uuid::new_v4();
            let now = Utc::now();
            let mut b = Booking::create(
                Uuid::new_v4(),
                client,
                None,
                "Cooking".to_string(),
                None,
                None,
                NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
                None,
                dec!(500),
                now,
            )
            .unwrap();
            b.accept(self.provider, "Asha".to_string(), now).unwrap();
            b.advance(self.provider, BookingStatus::InProgress, now).unwrap();
            b.advance(self.provider, BookingStatus::Completed, now).unwrap();
            self.deps.repo.insert(&b).await.unwrap();
            (client, b.id)
        }

        async fn rate(&self, client: Uuid, booking: Uuid, rating: u8) -> Result<RatingResult, AppError> {
            let context = OperationContext::for_caller(Identity::new(client, Role::Client));
            self.handler
                .rate(client, booking, RateCommand { rating, review: None }, &context)
                .await
        }
    }

    #[tokio::test]
    async fn test_mean_of_visible_ratings() {
        let f = Fixture::new().await;
        for rating in [5, 4, 4] {
            let (client, booking) = f.completed().await;
            f.rate(client, booking, rating).await.unwrap();
        }
        let provider = f.deps.repo.require::<Provider>(f.provider).await.unwrap().record;
        assert_eq!(provider.rating, dec!(4.33));
        assert_eq!(provider.display_rating(), dec!(4.3));
        assert_eq!(provider.total_reviews, 3);
    }

    #[tokio::test]
    async fn test_edit_window() {
        let f = Fixture::new().await;
        let (client, booking) = f.completed().await;
        f.rate(client, booking, 3).await.unwrap();

        f.clock.advance(Duration::days(6));
        let result = f.rate(client, booking, 5).await.unwrap();
        assert!(result.edited);
        assert_eq!(result.provider_rating, dec!(5));

        f.clock.advance(Duration::days(2));
        let err = f.rate(client, booking, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_out_of_range_rating() {
        let f = Fixture::new().await;
        let (client, booking) = f.completed().await;
        let err = f.rate(client, booking, 6).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_hide_and_unhide_recompute() {
        let f = Fixture::new().await;
        let (c1, b1) = f.completed().await;
        let (c2, b2) = f.completed().await;
        f.rate(c1, b1, 5).await.unwrap();
        f.rate(c2, b2, 1).await.unwrap();

        let hidden = f.handler.hide_review(b2, &f.admin).await.unwrap();
        assert_eq!(hidden.provider_rating, dec!(5));
        assert_eq!(hidden.total_reviews, 1);

        let shown = f.handler.unhide_review(b2, &f.admin).await.unwrap();
        assert_eq!(shown.provider_rating, dec!(3));
        assert_eq!(shown.total_reviews, 2);
    }

    #[tokio::test]
    async fn test_delete_review_incremental() {
        let f = Fixture::new().await;
        let mut bookings = Vec::new();
        for rating in [5, 4, 3] {
            let (client, booking) = f.completed().await;
            f.rate(client, booking, rating).await.unwrap();
            bookings.push(booking);
        }

        let result = f.handler.delete_review(bookings[2], &f.admin).await.unwrap();
        assert_eq!(result.provider_rating, dec!(4.5));
        assert_eq!(result.total_reviews, 2);

        // hidden review never counted
        f.handler.hide_review(bookings[1], &f.admin).await.unwrap();
        let result = f.handler.delete_review(bookings[1], &f.admin).await.unwrap();
        assert_eq!(result.provider_rating, dec!(5));
        assert_eq!(result.total_reviews, 1);

        let err = f.handler.delete_review(bookings[1], &f.admin).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_stale_recompute_cannot_overwrite_unchanged_aggregate() {
        let store = Arc::new(ContendedStore::default());
        let f = Arc::new(Fixture::with_store(store.clone()).await);
        let (ca, ba) = f.completed().await;
        let (cb, bb) = f.completed().await;
        f.rate(ca, ba, 5).await.unwrap();
        f.rate(cb, bb, 3).await.unwrap();

        // First edit scans (3, 3) and is held before its provider commit
        store.hold_next.store(true, Ordering::SeqCst);
        let slow = {
            let f = f.clone();
            tokio::spawn(async move { f.rate(ca, ba, 3).await })
        };
        store.held.notified().await;

        // Second edit sees (3, 5): the mean is still 4 over 2 reviews
        let fast = f.rate(cb, bb, 5).await.unwrap();
        assert_eq!(fast.provider_rating, dec!(4));

        store.release.notify_one();
        slow.await.unwrap().unwrap();

        let provider = f.deps.repo.require::<Provider>(f.provider).await.unwrap().record;
        assert_eq!(provider.total_reviews, 2);
        assert_eq!(provider.rating, dec!(4));
    }

    #[tokio::test]
    async fn test_rating_is_kept_when_aggregate_update_keeps_losing() {
        let store = Arc::new(ContendedStore::default());
        let f = Fixture::with_store(store.clone()).await;
        let (client, booking) = f.completed().await;

        store.always_conflict.store(true, Ordering::SeqCst);
        let result = f.rate(client, booking, 4).await.unwrap();
        assert!(!result.edited);
        assert_eq!(result.total_reviews, 0);

        let stored = f.deps.repo.require::<Booking>(booking).await.unwrap().record;
        assert_eq!(stored.visible_rating(), Some(4));

        // The next recompute repairs the aggregate
        store.always_conflict.store(false, Ordering::SeqCst);
        let provider = f.handler.recompute(f.provider).await.unwrap();
        assert_eq!(provider.rating, dec!(4));
        assert_eq!(provider.total_reviews, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ratings_converge() {
        let f = Arc::new(Fixture::new().await);
        let mut pairs = Vec::new();
        for _ in 0..6 {
            pairs.push(f.completed().await);
        }

        let mut handles = Vec::new();
        for (i, (client, booking)) in pairs.into_iter().enumerate() {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.rate(client, booking, if i % 2 == 0 { 5 } else { 2 }).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let provider = f.deps.repo.require::<Provider>(f.provider).await.unwrap().record;
        assert_eq!(provider.total_reviews, 6);
        assert_eq!(provider.rating, dec!(3.5));
    }
}
