//! Provider entity
//!
//! Marketplace-facing provider profile. Verification status and the
//! `verified` flag are driven by the verification record; `available`
//! is toggled by matching and by the provider; rating fields are owned by
//! the rating aggregator.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::verification::VerificationOutcome;
use super::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Submitted,
    Approved,
    Rejected,
    Blacklisted,
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStatus::Pending => write!(f, "pending"),
            VerificationStatus::Submitted => write!(f, "submitted"),
            VerificationStatus::Approved => write!(f, "approved"),
            VerificationStatus::Rejected => write!(f, "rejected"),
            VerificationStatus::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub blacklisted_by: Uuid,
    pub blacklisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    pub hourly_rate: Decimal,
    pub verified: bool,
    pub verification_status: VerificationStatus,
    pub available: bool,
    /// Mean of visible ratings, two decimal places
    pub rating: Decimal,
    pub total_reviews: u32,
    pub total_earnings: Decimal,
    #[serde(default)]
    pub completed_jobs: u32,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blacklist: Option<BlacklistEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn new(
        id: Uuid,
        name: String,
        skills: Vec<String>,
        specialty: Option<String>,
        hourly_rate: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            skills,
            specialty,
            hourly_rate,
            verified: false,
            verification_status: VerificationStatus::Pending,
            available: false,
            rating: Decimal::ZERO,
            total_reviews: 0,
            total_earnings: Decimal::ZERO,
            completed_jobs: 0,
            verified_at: None,
            blacklist: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklist.is_some()
    }

    /// Verified, approved and not blacklisted
    pub fn is_eligible(&self) -> bool {
        self.verified
            && self.verification_status == VerificationStatus::Approved
            && !self.is_blacklisted()
    }

    /// Eligibility gate for claiming work
    pub fn ensure_can_accept(&self) -> Result<(), DomainError> {
        if self.is_blacklisted() {
            return Err(DomainError::not_eligible(self.id, "provider is blacklisted"));
        }
        if !self.is_eligible() {
            return Err(DomainError::not_eligible(
                self.id,
                format!("verification status is {}", self.verification_status),
            ));
        }
        if !self.available {
            return Err(DomainError::not_eligible(self.id, "provider is not available"));
        }
        Ok(())
    }

    /// Fold the stage outcome into the provider flags
    pub fn apply_verification_outcome(&mut self, outcome: VerificationOutcome, now: DateTime<Utc>) {
        match outcome {
            VerificationOutcome::Approved => {
                self.verified = true;
                self.verified_at = Some(now);
                if !self.is_blacklisted() {
                    self.verification_status = VerificationStatus::Approved;
                }
            }
            VerificationOutcome::Rejected => {
                self.verified = false;
                self.available = false;
                if !self.is_blacklisted() {
                    self.verification_status = VerificationStatus::Rejected;
                }
            }
            VerificationOutcome::InReview => {}
        }
        self.updated_at = now;
    }

    /// A stage went in for review
    pub fn mark_submitted(&mut self, now: DateTime<Utc>) {
        if self.verification_status == VerificationStatus::Pending {
            self.verification_status = VerificationStatus::Submitted;
            self.updated_at = now;
        }
    }

    /// Admin demotion: back into the review queue
    pub fn unapprove(&mut self, now: DateTime<Utc>) {
        self.verified = false;
        self.available = false;
        self.verified_at = None;
        if !self.is_blacklisted() {
            self.verification_status = VerificationStatus::Submitted;
        }
        self.updated_at = now;
    }

    pub fn blacklist(&mut self, reason: String, by: Uuid, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.is_blacklisted() {
            return Err(DomainError::invalid_transition(
                "provider",
                VerificationStatus::Blacklisted,
                VerificationStatus::Blacklisted,
            ));
        }
        self.blacklist = Some(BlacklistEntry {
            reason,
            blacklisted_by: by,
            blacklisted_at: now,
        });
        self.verification_status = VerificationStatus::Blacklisted;
        self.available = false;
        self.updated_at = now;
        Ok(())
    }

    /// Lift the overlay; status falls back to what the stages say
    pub fn remove_blacklist(
        &mut self,
        outcome: VerificationOutcome,
        awaiting_review: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.is_blacklisted() {
            return Err(DomainError::invalid_transition(
                "provider",
                self.verification_status,
                "not blacklisted",
            ));
        }
        self.blacklist = None;
        self.verification_status = match outcome {
            VerificationOutcome::Approved if self.verified => VerificationStatus::Approved,
            VerificationOutcome::Rejected => VerificationStatus::Rejected,
            _ if awaiting_review => VerificationStatus::Submitted,
            _ => VerificationStatus::Pending,
        };
        self.updated_at = now;
        Ok(())
    }

    pub fn set_available(&mut self, available: bool, now: DateTime<Utc>) -> Result<(), DomainError> {
        if available && !self.is_eligible() {
            return Err(DomainError::not_eligible(
                self.id,
                format!("verification status is {}", self.verification_status),
            ));
        }
        self.available = available;
        self.updated_at = now;
        Ok(())
    }

    /// Replace rating aggregate with a freshly computed one
    pub fn set_rating(&mut self, rating: Decimal, total_reviews: u32, now: DateTime<Utc>) {
        self.rating = round_rating(rating, 2);
        self.total_reviews = total_reviews;
        self.updated_at = now;
    }

    /// Take one visible rating out of the aggregate without a rescan
    pub fn remove_rating(&mut self, removed: u8, now: DateTime<Utc>) {
        if self.total_reviews <= 1 {
            self.rating = Decimal::ZERO;
            self.total_reviews = 0;
        } else {
            let count = Decimal::from(self.total_reviews);
            let remaining = (self.rating * count - Decimal::from(removed)) / (count - Decimal::ONE);
            self.rating = round_rating(remaining.max(Decimal::ZERO), 2);
            self.total_reviews -= 1;
        }
        self.updated_at = now;
    }

    pub fn record_completed_job(&mut self, now: DateTime<Utc>) {
        self.completed_jobs += 1;
        if self.is_eligible() {
            self.available = true;
        }
        self.updated_at = now;
    }

    pub fn record_earnings(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.total_earnings += amount;
        self.updated_at = now;
    }

    /// Rating shown to clients
    pub fn display_rating(&self) -> Decimal {
        round_rating(self.rating, 1)
    }

    /// Skill/specialty match against a free-form service type.
    /// Case-insensitive substring in either direction.
    pub fn matches_service(&self, service_type: &str) -> bool {
        let wanted = service_type.trim().to_lowercase();
        if wanted.is_empty() {
            return false;
        }
        self.specialty
            .iter()
            .chain(self.skills.iter())
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .any(|term| wanted.contains(&term) || term.contains(&wanted))
    }
}

pub fn round_rating(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}
