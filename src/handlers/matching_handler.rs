//! Matching Handler
//!
//! Surfaces open requests to eligible providers and resolves concurrent
//! claims on one request. The claim is a compare-and-set on the booking
//! version, so exactly one provider can win.

use uuid::Uuid;

use crate::domain::{Booking, DomainError, OperationContext, Provider, Role};
use crate::error::AppError;
use crate::projection::MarketplaceIndex;

use super::deps::{acting_as, HandlerDeps};
use super::{AcceptResult, AvailabilityUpdate};

// =========================================================================
// MatchingHandler
// =========================================================================

pub struct MatchingHandler {
    deps: HandlerDeps,
}

impl MatchingHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    /// Open requests whose service type matches the provider's skills or
    /// specialty, earliest scheduled first.
    pub async fn list_eligible_requests(
        &self,
        provider_id: Uuid,
        context: &OperationContext,
    ) -> Result<Vec<Booking>, AppError> {
        acting_as(context, Role::Provider, provider_id)?;

        let provider = self.deps.repo.require::<Provider>(provider_id).await?.record;
        if !provider.is_eligible() {
            return Err(DomainError::not_eligible(
                provider_id,
                format!("verification status is {}", provider.verification_status),
            )
            .into());
        }

        let mut requests: Vec<Booking> = self
            .deps
            .repo
            .open_requests()
            .await?
            .into_iter()
            .map(|entry| entry.record)
            .filter(|booking| provider.matches_service(&booking.service_type))
            .collect();
        requests.sort_by(|a, b| {
            (a.scheduled_date, a.scheduled_time, a.created_at)
                .cmp(&(b.scheduled_date, b.scheduled_time, b.created_at))
        });

        tracing::debug!(%provider_id, matches = requests.len(), "Listed eligible requests");
        Ok(requests)
    }

    /// Claim an open request. Losers of a race get `Conflict`.
    pub async fn accept(
        &self,
        provider_id: Uuid,
        request_id: Uuid,
        context: &OperationContext,
    ) -> Result<AcceptResult, AppError> {
        acting_as(context, Role::Provider, provider_id)?;

        let provider = self.deps.repo.require::<Provider>(provider_id).await?.record;
        provider.ensure_can_accept()?;

        let now = self.deps.clock.now();
        let (booking, ()) = self
            .deps
            .repo
            .update::<Booking, _, _>(request_id, |booking| {
                booking
                    .accept(provider_id, provider.name.clone(), now)
                    .map_err(AppError::from)
            })
            .await
            .map_err(|err| {
                tracing::info!(%provider_id, %request_id, error = %err, "Accept rejected");
                err
            })?;

        // The booking is ours; taking the provider off the market is best effort
        let availability: AvailabilityUpdate = self
            .deps
            .availability
            .apply_or_queue(provider_id, false, "accepted booking")
            .await
            .into();

        tracing::info!(
            %provider_id,
            %request_id,
            ?availability,
            "Request accepted"
        );
        Ok(AcceptResult { booking, availability })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EngineSettings;
    use crate::domain::{BookingStatus, Identity, VerificationOutcome};
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn deps() -> HandlerDeps {
        HandlerDeps::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            EngineSettings::default(),
        )
    }

    async fn seed_provider(deps: &HandlerDeps, skills: &[&str], approved: bool) -> Uuid {
        let now = Utc::now();
        let mut provider = Provider::new(
            Uuid::new_v4(),
            "Asha".to_string(),
            skills.iter().map(|s| s.to_string()).collect(),
            None,
            dec!(350),
            now,
        );
        if approved {
            provider.apply_verification_outcome(VerificationOutcome::Approved, now);
            provider.set_available(true, now).unwrap();
        }
        deps.repo.insert(&provider).await.unwrap();
        provider.id
    }

    async fn seed_request(deps: &HandlerDeps, service: &str, day: u32) -> Uuid {
        let booking = Booking::create(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            service.to_string(),
            None,
            None,
            NaiveDate::from_ymd_opt(2026, 11, day).unwrap(),
            None,
            dec!(1200),
            Utc::now(),
        )
        .unwrap();
        deps.repo.insert(&booking).await.unwrap();
        booking.id
    }

    fn as_provider(id: Uuid) -> OperationContext {
        OperationContext::for_caller(Identity::new(id, Role::Provider))
    }

    #[tokio::test]
    async fn test_eligible_requests_filtered_and_ordered() {
        let deps = deps();
        let handler = MatchingHandler::new(deps.clone());
        let provider = seed_provider(&deps, &["elder-care"], true).await;

        let later = seed_request(&deps, "Elder-Care-Basic", 9).await;
        let sooner = seed_request(&deps, "elder-care overnight", 3).await;
        seed_request(&deps, "Physiotherapy", 1).await;

        let found = handler
            .list_eligible_requests(provider, &as_provider(provider))
            .await
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![sooner, later]);
    }

    #[tokio::test]
    async fn test_unverified_provider_sees_nothing() {
        let deps = deps();
        let handler = MatchingHandler::new(deps.clone());
        let provider = seed_provider(&deps, &["elder-care"], false).await;

        let err = handler
            .list_eligible_requests(provider, &as_provider(provider))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_accept_claims_and_takes_provider_off_market() {
        let deps = deps();
        let handler = MatchingHandler::new(deps.clone());
        let provider = seed_provider(&deps, &["cooking"], true).await;
        let request = seed_request(&deps, "Cooking", 4).await;

        let result = handler
            .accept(provider, request, &as_provider(provider))
            .await
            .unwrap();
        assert_eq!(result.booking.status, BookingStatus::Accepted);
        assert_eq!(result.booking.provider_id, Some(provider));
        assert_eq!(result.availability, AvailabilityUpdate::Applied);

        let stored = deps.repo.require::<Provider>(provider).await.unwrap().record;
        assert!(!stored.available);
        assert!(deps.repo.open_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_accept_conflicts() {
        let deps = deps();
        let handler = MatchingHandler::new(deps.clone());
        let first = seed_provider(&deps, &["cooking"], true).await;
        let second = seed_provider(&deps, &["cooking"], true).await;
        let request = seed_request(&deps, "Cooking", 4).await;

        handler.accept(first, request, &as_provider(first)).await.unwrap();
        let err = handler
            .accept(second, request, &as_provider(second))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let booking = deps.repo.require::<Booking>(request).await.unwrap().record;
        assert_eq!(booking.provider_id, Some(first));
    }

    #[tokio::test]
    async fn test_accept_unknown_request_not_found() {
        let deps = deps();
        let handler = MatchingHandler::new(deps.clone());
        let provider = seed_provider(&deps, &["cooking"], true).await;

        let err = handler
            .accept(provider, Uuid::new_v4(), &as_provider(provider))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
