//! Verification Handler
//!
//! Four-stage provider verification. Every operation that touches both the
//! verification record and the provider writes them in one commit, so the
//! `verified` flag can never disagree with the stages.

use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogBuilder};
use crate::domain::{OperationContext, Provider, Role, StageId, StageStatus, VerificationRecord};
use crate::error::AppError;
use crate::projection::MarketplaceIndex;
use crate::store::{Changeset, Versioned};

use super::deps::{acting_as, self_or_admin, HandlerDeps};
use super::{ReviewQueueItem, ReviewStageCommand, VerificationStatusView};

// =========================================================================
// VerificationHandler
// =========================================================================

pub struct VerificationHandler {
    deps: HandlerDeps,
}

impl VerificationHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    async fn load_pair(
        &self,
        provider_id: Uuid,
    ) -> Result<(Versioned<VerificationRecord>, Versioned<Provider>), AppError> {
        let record = self.deps.repo.require::<VerificationRecord>(provider_id).await?;
        let provider = self.deps.repo.require::<Provider>(provider_id).await?;
        Ok((record, provider))
    }

    async fn commit_pair(
        &self,
        record: (&Versioned<VerificationRecord>, &VerificationRecord),
        provider: (&Versioned<Provider>, &Provider),
    ) -> Result<(), AppError> {
        let mut changes = Changeset::new();
        changes.save(record.0, record.1)?.save(provider.0, provider.1)?;
        self.deps.repo.commit(changes).await
    }

    // =========================================================================
    // Provider side
    // =========================================================================

    /// Provider submits (or resubmits) data for one stage
    pub async fn submit_stage(
        &self,
        provider_id: Uuid,
        stage: StageId,
        data: serde_json::Value,
        context: &OperationContext,
    ) -> Result<VerificationStatusView, AppError> {
        acting_as(context, Role::Provider, provider_id)?;
        let enforce_order = self.deps.settings.enforce_stage_order;

        let view = self
            .deps
            .repo
            .retry("verification.submit_stage", || {
                let data = data.clone();
                async move {
                    let now = self.deps.clock.now();
                    let (loaded_record, loaded_provider) = self.load_pair(provider_id).await?;

                    let mut record = loaded_record.record.clone();
                    record.submit(stage, data, enforce_order, now)?;
                    let mut provider = loaded_provider.record.clone();
                    provider.mark_submitted(now);

                    self.commit_pair((&loaded_record, &record), (&loaded_provider, &provider))
                        .await?;
                    Ok(VerificationStatusView::new(&provider, &record))
                }
            })
            .await?;

        tracing::info!(%provider_id, %stage, "Verification stage submitted");
        Ok(view)
    }

    /// Record plus provider flags; the provider or an admin may look
    pub async fn status(
        &self,
        provider_id: Uuid,
        context: &OperationContext,
    ) -> Result<VerificationStatusView, AppError> {
        self_or_admin(context, provider_id)?;
        let (record, provider) = self.load_pair(provider_id).await?;
        Ok(VerificationStatusView::new(&provider.record, &record.record))
    }

    // =========================================================================
    // Admin side
    // =========================================================================

    /// Approve or reject a submitted stage, then fold the outcome into the
    /// provider's eligibility.
    pub async fn review(
        &self,
        provider_id: Uuid,
        stage: StageId,
        command: ReviewStageCommand,
        context: &OperationContext,
    ) -> Result<VerificationStatusView, AppError> {
        let reviewer_id = context.require_admin()?.user_id;
        let enforce_order = self.deps.settings.enforce_stage_order;
        let action = command.action;

        let (before, view) = self
            .deps
            .repo
            .retry("verification.review", || {
                let notes = command.notes.clone();
                async move {
                    let now = self.deps.clock.now();
                    let (loaded_record, loaded_provider) = self.load_pair(provider_id).await?;

                    let mut record = loaded_record.record.clone();
                    let outcome =
                        record.review(stage, action, notes, reviewer_id, enforce_order, now)?;
                    let mut provider = loaded_provider.record.clone();
                    provider.apply_verification_outcome(outcome, now);

                    self.commit_pair((&loaded_record, &record), (&loaded_provider, &provider))
                        .await?;
                    Ok((
                        VerificationStatusView::new(&loaded_provider.record, &loaded_record.record),
                        VerificationStatusView::new(&provider, &record),
                    ))
                }
            })
            .await?;

        tracing::info!(
            %provider_id,
            %stage,
            action = ?action,
            status = %view.verification_status,
            verified = view.verified,
            "Verification stage reviewed"
        );
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::StageReviewed)
                    .resource("provider", provider_id)
                    .before_state(&before)
                    .after_state(&view),
                context,
            )
            .await;

        Ok(view)
    }

    /// Demote a provider: all stages back to submitted, not verified, not
    /// available.
    pub async fn unapprove(
        &self,
        provider_id: Uuid,
        context: &OperationContext,
    ) -> Result<VerificationStatusView, AppError> {
        context.require_admin()?;

        let (before, view) = self
            .deps
            .repo
            .retry("verification.unapprove", || async move {
                let now = self.deps.clock.now();
                let (loaded_record, loaded_provider) = self.load_pair(provider_id).await?;

                let mut record = loaded_record.record.clone();
                record.reset_for_review(now);
                let mut provider = loaded_provider.record.clone();
                provider.unapprove(now);

                self.commit_pair((&loaded_record, &record), (&loaded_provider, &provider))
                    .await?;
                Ok((
                    VerificationStatusView::new(&loaded_provider.record, &loaded_record.record),
                    VerificationStatusView::new(&provider, &record),
                ))
            })
            .await?;

        tracing::warn!(%provider_id, "Provider unapproved");
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::ProviderUnapproved)
                    .resource("provider", provider_id)
                    .before_state(&before)
                    .after_state(&view),
                context,
            )
            .await;

        Ok(view)
    }

    pub async fn blacklist(
        &self,
        provider_id: Uuid,
        reason: String,
        context: &OperationContext,
    ) -> Result<Provider, AppError> {
        let admin_id = context.require_admin()?.user_id;
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(AppError::InvalidArgument("blacklist reason is required".to_string()));
        }
        let now = self.deps.clock.now();

        let (provider, before) = self
            .deps
            .repo
            .update::<Provider, _, _>(provider_id, |provider| {
                let before = provider.clone();
                provider.blacklist(reason.clone(), admin_id, now)?;
                Ok(before)
            })
            .await?;

        tracing::warn!(%provider_id, reason = %reason, "Provider blacklisted");
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::ProviderBlacklisted)
                    .resource("provider", provider_id)
                    .before_state(&before)
                    .after_state(&provider),
                context,
            )
            .await;

        Ok(provider)
    }

    /// Lift the overlay; the status falls back to what the stages say. The
    /// record is re-saved unchanged so a concurrent review forces a retry.
    pub async fn remove_blacklist(
        &self,
        provider_id: Uuid,
        context: &OperationContext,
    ) -> Result<Provider, AppError> {
        context.require_admin()?;

        let (before, provider) = self
            .deps
            .repo
            .retry("verification.remove_blacklist", || async move {
                let now = self.deps.clock.now();
                let (loaded_record, loaded_provider) = self.load_pair(provider_id).await?;

                let record = &loaded_record.record;
                let mut provider = loaded_provider.record.clone();
                provider.remove_blacklist(record.outcome(), record.awaiting_review(), now)?;

                self.commit_pair((&loaded_record, record), (&loaded_provider, &provider))
                    .await?;
                Ok((loaded_provider.record, provider))
            })
            .await?;

        tracing::info!(
            %provider_id,
            status = %provider.verification_status,
            "Provider blacklist removed"
        );
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::BlacklistRemoved)
                    .resource("provider", provider_id)
                    .before_state(&before)
                    .after_state(&provider),
                context,
            )
            .await;

        Ok(provider)
    }

    /// Providers with at least one stage waiting for a decision, oldest first
    pub async fn review_queue(&self, context: &OperationContext) -> Result<Vec<ReviewQueueItem>, AppError> {
        context.require_admin()?;

        let mut items = Vec::new();
        for entry in self.deps.repo.review_queue().await? {
            let record = entry.record;
            let provider_name = self
                .deps
                .repo
                .load::<Provider>(record.provider_id)
                .await?
                .map(|p| p.record.name);
            let submitted_stages = record
                .stage_summary()
                .into_iter()
                .filter(|(_, status)| *status == StageStatus::Submitted)
                .map(|(stage, _)| stage)
                .collect();
            items.push(ReviewQueueItem {
                provider_id: record.provider_id,
                provider_name,
                submitted_stages,
                updated_at: record.updated_at,
            });
        }
        items.sort_by_key(|item| item.updated_at);
        Ok(items)
    }
}
