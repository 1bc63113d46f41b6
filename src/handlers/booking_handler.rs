//! Booking Handler
//!
//! Service request lifecycle from creation to settlement.

use std::str::FromStr;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogBuilder};
use crate::domain::{
    Amount, Booking, BookingStatus, OperationContext, Provider, Role, TransactionMeta, Wallet,
};
use crate::error::AppError;
use crate::jobs::AvailabilitySync;
use crate::projection::MarketplaceIndex;
use crate::store::{Changeset, Versioned};

use super::deps::{acting_as, self_or_admin, HandlerDeps};
use super::{CreateRequestCommand, SettlementResult};

// =========================================================================
// BookingHandler
// =========================================================================

pub struct BookingHandler {
    deps: HandlerDeps,
}

impl BookingHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }

    /// Client posts a new request; it starts pending and unassigned
    pub async fn create_request(
        &self,
        command: CreateRequestCommand,
        context: &OperationContext,
    ) -> Result<Booking, AppError> {
        let caller = context.require_role(Role::Client)?;
        let estimated_cost = Decimal::from_str(command.estimated_cost.trim())
            .map_err(|e| AppError::InvalidArgument(format!("Invalid estimated cost: {}", e)))?;

        let booking = Booking::create(
            Uuid::new_v4(),
            caller.user_id,
            caller.display_name.clone(),
            command.service_type,
            command.description,
            command.address,
            command.scheduled_date,
            command.scheduled_time,
            estimated_cost,
            self.deps.clock.now(),
        )?;
        self.deps.repo.insert(&booking).await?;

        tracing::info!(
            booking_id = %booking.id,
            client_id = %booking.client_id,
            service_type = %booking.service_type,
            "Service request created"
        );
        Ok(booking)
    }

    /// Visible to the owning client, the assigned (or released) provider,
    /// admins, and any provider while the request is still open.
    pub async fn get(&self, booking_id: Uuid, context: &OperationContext) -> Result<Booking, AppError> {
        let caller = context.caller()?;
        let booking = self.deps.repo.require::<Booking>(booking_id).await?.record;

        let released = booking
            .cancellation
            .as_ref()
            .and_then(|c| c.released_provider);
        let allowed = caller.is_admin()
            || booking.client_id == caller.user_id
            || booking.provider_id == Some(caller.user_id)
            || released == Some(caller.user_id)
            || (caller.role == Role::Provider && booking.is_open());
        if !allowed {
            return Err(AppError::Forbidden(format!(
                "booking {} is not visible to {}",
                booking_id, caller.user_id
            )));
        }
        Ok(booking)
    }

    /// Assigned provider moves the job along. Completion also bumps the
    /// provider's job count and puts them back on the market in the same
    /// commit, replacing any availability change still queued from accept.
    pub async fn update_status(
        &self,
        provider_id: Uuid,
        booking_id: Uuid,
        target: BookingStatus,
        context: &OperationContext,
    ) -> Result<Booking, AppError> {
        acting_as(context, Role::Provider, provider_id)?;
        if !matches!(target, BookingStatus::InProgress | BookingStatus::Completed) {
            return Err(AppError::InvalidArgument(format!(
                "providers can only move a booking to in-progress or completed, not {}",
                target
            )));
        }

        let booking = self
            .deps
            .repo
            .retry("booking.update_status", || async move {
                let now = self.deps.clock.now();
                let loaded = self.deps.repo.require::<Booking>(booking_id).await?;
                let mut booking = loaded.record.clone();
                if !booking.advance(provider_id, target, now)? {
                    return Ok(booking);
                }

                let mut changes = Changeset::new();
                changes.save(&loaded, &booking)?;
                if target == BookingStatus::Completed {
                    if let Some(loaded_provider) = self.deps.repo.load::<Provider>(provider_id).await? {
                        let mut provider = loaded_provider.record.clone();
                        provider.record_completed_job(now);
                        changes.save(&loaded_provider, &provider)?;
                        AvailabilitySync::supersede_queued(&mut changes, provider_id);
                    }
                }
                self.deps.repo.commit(changes).await?;
                Ok(booking)
            })
            .await?;

        tracing::info!(%booking_id, %provider_id, status = %booking.status, "Booking status updated");
        Ok(booking)
    }

    /// Client cancels a pending or accepted booking; an assigned provider is
    /// released back to the market.
    pub async fn cancel(
        &self,
        client_id: Uuid,
        booking_id: Uuid,
        reason: Option<String>,
        context: &OperationContext,
    ) -> Result<Booking, AppError> {
        acting_as(context, Role::Client, client_id)?;
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let now = self.deps.clock.now();

        let (booking, released) = self
            .deps
            .repo
            .update::<Booking, _, _>(booking_id, |booking| {
                booking.cancel(client_id, reason.clone(), now).map_err(AppError::from)
            })
            .await?;

        if let Some(provider_id) = released {
            let outcome = self
                .deps
                .availability
                .apply_or_queue(provider_id, true, "booking cancelled")
                .await;
            tracing::debug!(%provider_id, ?outcome, "Released provider");
        }

        tracing::info!(%booking_id, %client_id, released = ?released, "Booking cancelled");
        Ok(booking)
    }

    pub async fn add_note(
        &self,
        provider_id: Uuid,
        booking_id: Uuid,
        note: String,
        context: &OperationContext,
    ) -> Result<Booking, AppError> {
        acting_as(context, Role::Provider, provider_id)?;
        let now = self.deps.clock.now();

        let (booking, ()) = self
            .deps
            .repo
            .update::<Booking, _, _>(booking_id, |booking| {
                booking
                    .add_provider_note(provider_id, note.clone(), now)
                    .map_err(AppError::from)
            })
            .await?;
        Ok(booking)
    }

    /// Newest first
    pub async fn list_client_bookings(
        &self,
        client_id: Uuid,
        context: &OperationContext,
    ) -> Result<Vec<Booking>, AppError> {
        self_or_admin(context, client_id)?;
        let bookings = self.deps.repo.client_bookings(client_id).await?;
        Ok(newest_first(bookings))
    }

    /// Newest first; includes bookings the provider was released from
    pub async fn list_provider_bookings(
        &self,
        provider_id: Uuid,
        context: &OperationContext,
    ) -> Result<Vec<Booking>, AppError> {
        self_or_admin(context, provider_id)?;
        let bookings = self.deps.repo.provider_bookings(provider_id).await?;
        Ok(newest_first(bookings))
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Pay the provider for a completed booking. The client debit, provider
    /// credit and settlement marker land in one commit.
    pub async fn settle(
        &self,
        client_id: Uuid,
        booking_id: Uuid,
        context: &OperationContext,
    ) -> Result<SettlementResult, AppError> {
        acting_as(context, Role::Client, client_id)?;
        let log_cap = self.deps.settings.wallet_log_cap;

        let (result, provider_id) = self
            .deps
            .repo
            .retry("booking.settle", || async move {
                let now = self.deps.clock.now();
                let loaded = self.deps.repo.require::<Booking>(booking_id).await?;
                let mut booking = loaded.record.clone();
                booking.ensure_client(client_id)?;

                let transfer_id = Uuid::new_v4();
                let cost = booking.settle(transfer_id, now)?;
                let provider_id = booking.provider_id.ok_or_else(|| {
                    AppError::Internal(format!("completed booking {} has no provider", booking_id))
                })?;

                let mut changes = Changeset::new();
                changes.save(&loaded, &booking)?;

                let client_balance = if cost > Decimal::ZERO {
                    let amount = Amount::new(cost)
                        .map_err(|e| AppError::InvalidArgument(format!("Invalid booking cost: {}", e)))?;
                    let loaded_client = self.load_wallet(client_id).await?;
                    let loaded_provider = self.load_wallet(provider_id).await?;

                    let mut client = loaded_client.record.clone();
                    client.debit(
                        &amount,
                        TransactionMeta::new(format!("Payment for {}", booking.service_type))
                            .with_booking(booking_id)
                            .with_transfer(transfer_id, provider_id),
                        log_cap,
                        now,
                    )?;
                    let mut provider = loaded_provider.record.clone();
                    provider.credit(
                        &amount,
                        TransactionMeta::new(format!("Earnings for {}", booking.service_type))
                            .with_booking(booking_id)
                            .with_transfer(transfer_id, client_id),
                        log_cap,
                        now,
                    )?;

                    changes.save(&loaded_client, &client)?.save(&loaded_provider, &provider)?;
                    client.balance.value()
                } else {
                    self.load_wallet(client_id).await?.record.balance.value()
                };

                self.deps.repo.commit(changes).await?;
                Ok((
                    SettlementResult {
                        booking_id,
                        transfer_id,
                        amount: cost,
                        client_balance,
                    },
                    provider_id,
                ))
            })
            .await?;

        // Earnings total is informational; a lost write is logged, not fatal
        if result.amount > Decimal::ZERO {
            let now = self.deps.clock.now();
            let amount = result.amount;
            if let Err(err) = self
                .deps
                .repo
                .update::<Provider, _, _>(provider_id, |provider| {
                    provider.record_earnings(amount, now);
                    Ok(())
                })
                .await
            {
                tracing::warn!(%provider_id, %booking_id, error = %err, "Failed to update provider earnings");
            }
        }

        tracing::info!(
            %booking_id,
            %client_id,
            %provider_id,
            transfer_id = %result.transfer_id,
            amount = %result.amount,
            "Booking settled"
        );
        self.deps
            .audit
            .record(
                AuditLogBuilder::new(AuditAction::BookingSettled)
                    .resource("booking", booking_id)
                    .after_state(&result),
                context,
            )
            .await;

        Ok(result)
    }

    async fn load_wallet(&self, account_id: Uuid) -> Result<Versioned<Wallet>, AppError> {
        let now = self.deps.clock.now();
        self.deps
            .repo
            .load_or_else(account_id, || Wallet::open(account_id, now))
            .await
    }
}

fn newest_first(bookings: Vec<Versioned<Booking>>) -> Vec<Booking> {
    let mut bookings: Vec<Booking> = bookings.into_iter().map(|b| b.record).collect();
    bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    bookings
}
