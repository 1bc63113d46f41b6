//! Provider Handler
//!
//! Provider signup, profile reads and the availability toggle.

use std::str::FromStr;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogBuilder};
use crate::domain::{OperationContext, Provider, Role, VerificationRecord};
use crate::error::AppError;
use crate::jobs::AvailabilitySync;
use crate::store::Changeset;

use super::deps::{acting_as, HandlerDeps};
use super::RegisterProviderCommand;

// =========================================================================
// ProviderHandler
// =========================================================================

pub struct ProviderHandler {
    deps: HandlerDeps,
}

impl ProviderHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    /// Create the provider profile and its seeded verification record in one
    /// commit. The provider id is the caller's user id.
    pub async fn register(
        &self,
        command: RegisterProviderCommand,
        context: &OperationContext,
    ) -> Result<Provider, AppError> {
        let caller = context.require_role(Role::Provider)?;
        let provider_id = caller.user_id;

        let name = command.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::InvalidArgument("provider name is required".to_string()));
        }
        let hourly_rate = Decimal::from_str(command.hourly_rate.trim())
            .map_err(|e| AppError::InvalidArgument(format!("Invalid hourly rate: {}", e)))?;
        if hourly_rate < Decimal::ZERO {
            return Err(AppError::InvalidArgument(format!(
                "hourly rate cannot be negative (got {})",
                hourly_rate
            )));
        }

        let now = self.deps.clock.now();
        let mut provider = Provider::new(
            provider_id,
            name,
            command.skills,
            command.specialty,
            hourly_rate,
            now,
        );
        let record = VerificationRecord::seed(provider_id, command.signup_data, now);
        if record.awaiting_review() {
            provider.mark_submitted(now);
        }

        let mut changes = Changeset::new();
        changes.insert(&provider)?.insert(&record)?;
        self.deps.repo.commit(changes).await.map_err(|err| {
            if err.is_retryable() {
                AppError::Conflict(format!("provider {} is already registered", provider_id))
            } else {
                err
            }
        })?;

        tracing::info!(
            %provider_id,
            status = %provider.verification_status,
            "Provider registered"
        );
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::ProviderRegistered)
                    .resource("provider", provider_id)
                    .after_state(&provider),
                context,
            )
            .await;

        Ok(provider)
    }

    pub async fn get(&self, provider_id: Uuid, context: &OperationContext) -> Result<Provider, AppError> {
        context.caller()?;
        Ok(self.deps.repo.require::<Provider>(provider_id).await?.record)
    }

    /// Provider toggles whether they take new work
    pub async fn set_availability(
        &self,
        provider_id: Uuid,
        available: bool,
        context: &OperationContext,
    ) -> Result<Provider, AppError> {
        acting_as(context, Role::Provider, provider_id)?;
        let now = self.deps.clock.now();

        let provider = self
            .deps
            .repo
            .retry("provider.set_availability", || async move {
                let loaded = self.deps.repo.require::<Provider>(provider_id).await?;
                let mut provider = loaded.record.clone();
                provider.set_available(available, now)?;

                let mut changes = Changeset::new();
                changes.save(&loaded, &provider)?;
                AvailabilitySync::supersede_queued(&mut changes, provider_id);
                self.deps.repo.commit(changes).await?;
                Ok(provider)
            })
            .await?;

        tracing::info!(%provider_id, available, "Provider availability changed");
        Ok(provider)
    }
}
