//! Command definitions
//!
//! Commands represent intentions to change the system state; results and
//! views are what the handlers hand back.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    BlacklistEntry, Booking, BookingStatus, Provider, ReviewAction, ReviewNote, StageId,
    StageStatus, VerificationRecord, VerificationStatus, WalletTransaction,
};
use crate::jobs::SyncOutcome;

// =========================================================================
// Providers & verification
// =========================================================================

/// Provider signup. The provider id is the caller's user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterProviderCommand {
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    /// Decimal string
    pub hourly_rate: String,
    /// Stage data supplied at signup; those stages start as submitted
    #[serde(default)]
    pub signup_data: BTreeMap<StageId, serde_json::Value>,
}

impl RegisterProviderCommand {
    pub fn new(name: impl Into<String>, hourly_rate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skills: Vec::new(),
            specialty: None,
            hourly_rate: hourly_rate.into(),
            signup_data: BTreeMap::new(),
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn with_stage_data(mut self, stage: StageId, data: serde_json::Value) -> Self {
        self.signup_data.insert(stage, data);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewStageCommand {
    pub action: ReviewAction,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage: StageId,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewNote>,
}

/// Verification record plus the provider flags derived from it
#[derive(Debug, Clone, Serialize)]
pub struct VerificationStatusView {
    pub provider_id: Uuid,
    pub verification_status: VerificationStatus,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub available: bool,
    pub stages: Vec<StageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<BlacklistEntry>,
}

impl VerificationStatusView {
    pub fn new(provider: &Provider, record: &VerificationRecord) -> Self {
        let stages = record
            .stage_summary()
            .into_iter()
            .map(|(stage, status)| StageView {
                stage,
                status,
                review: record.review_notes.get(&stage).cloned(),
            })
            .collect();

        Self {
            provider_id: provider.id,
            verification_status: provider.verification_status,
            verified: provider.verified,
            verified_at: provider.verified_at,
            available: provider.available,
            stages,
            blacklist: provider.blacklist.clone(),
        }
    }
}

/// Entry in the admin review queue
#[derive(Debug, Clone, Serialize)]
pub struct ReviewQueueItem {
    pub provider_id: Uuid,
    pub provider_name: Option<String>,
    pub submitted_stages: Vec<StageId>,
    pub updated_at: DateTime<Utc>,
}

// =========================================================================
// Matching & bookings
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequestCommand {
    pub service_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub scheduled_date: NaiveDate,
    #[serde(default)]
    pub scheduled_time: Option<NaiveTime>,
    /// Decimal string
    pub estimated_cost: String,
}

impl CreateRequestCommand {
    pub fn new(service_type: impl Into<String>, scheduled_date: NaiveDate, estimated_cost: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            description: None,
            address: None,
            scheduled_date,
            scheduled_time: None,
            estimated_cost: estimated_cost.into(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_time(mut self, time: NaiveTime) -> Self {
        self.scheduled_time = Some(time);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptResult {
    pub booking: Booking,
    /// What happened to the provider's availability flag
    pub availability: AvailabilityUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityUpdate {
    Applied,
    Skipped,
    Queued,
}

impl From<SyncOutcome> for AvailabilityUpdate {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Applied => AvailabilityUpdate::Applied,
            SyncOutcome::Dropped => AvailabilityUpdate::Skipped,
            SyncOutcome::Queued => AvailabilityUpdate::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusCommand {
    pub status: BookingStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementResult {
    pub booking_id: Uuid,
    pub transfer_id: Uuid,
    pub amount: Decimal,
    pub client_balance: Decimal,
}

// =========================================================================
// Ratings
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCommand {
    pub rating: u8,
    #[serde(default)]
    pub review: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatingResult {
    pub booking_id: Uuid,
    pub provider_id: Uuid,
    pub edited: bool,
    /// Stored aggregate (2dp)
    pub provider_rating: Decimal,
    /// Rounded for display (1dp)
    pub display_rating: Decimal,
    pub total_reviews: u32,
}

impl RatingResult {
    pub fn new(booking_id: Uuid, edited: bool, provider: &Provider) -> Self {
        Self {
            booking_id,
            provider_id: provider.id,
            edited,
            provider_rating: provider.rating,
            display_rating: provider.display_rating(),
            total_reviews: provider.total_reviews,
        }
    }
}

// =========================================================================
// Ledger
// =========================================================================

/// Command to move money between two wallets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCommand {
    pub to_account_id: Uuid,
    /// Decimal string
    pub amount: String,
    #[serde(default)]
    pub memo: Option<String>,
}

impl TransferCommand {
    pub fn new(to_account_id: Uuid, amount: impl Into<String>) -> Self {
        Self {
            to_account_id,
            amount: amount.into(),
            memo: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Admin balance adjustment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustWalletCommand {
    pub amount: String,
    pub description: String,
}

/// Wallet top-up backed by a gateway payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCreditCommand {
    pub amount: String,
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: Decimal,
    pub from_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentCreditResult {
    pub payment_id: String,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub balance: Decimal,
    /// The payment had been credited before; nothing changed
    pub already_processed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletEntryResult {
    pub account_id: Uuid,
    pub balance: Decimal,
    pub transaction: WalletTransaction,
}
