//! Booking (service request) entity
//!
//! Status machine: `pending -> accepted -> in_progress -> completed`, with
//! `cancelled` reachable from `pending` or `accepted`. A booking carries a
//! provider only while accepted, in progress or completed.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Amount, DomainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    #[serde(rename = "in-progress", alias = "in_progress")]
    InProgress,
    Completed,
    Cancelled,
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingStatus::Pending => write!(f, "pending"),
            BookingStatus::Accepted => write!(f, "accepted"),
            BookingStatus::InProgress => write!(f, "in-progress"),
            BookingStatus::Completed => write!(f, "completed"),
            BookingStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Client review stored on the booking it rates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    #[serde(alias = "userRating")]
    pub rating: u8,
    #[serde(default, alias = "review")]
    pub text: Option<String>,
    pub rated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
    /// Provider released by cancelling an accepted booking
    pub released_provider: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderNote {
    pub note: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub transfer_id: Uuid,
    pub amount: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// Outcome of a rating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingChange {
    Created,
    Edited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub client_id: Uuid,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub provider_id: Option<Uuid>,
    #[serde(default)]
    pub provider_name: Option<String>,
    pub service_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub status: BookingStatus,
    pub scheduled_date: NaiveDate,
    #[serde(default)]
    pub scheduled_time: Option<NaiveTime>,
    pub estimated_cost: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation: Option<Cancellation>,
    #[serde(default)]
    pub provider_notes: Vec<ProviderNote>,
    #[serde(default)]
    pub review: Option<Review>,
    #[serde(default)]
    pub settlement: Option<Settlement>,
}

impl Booking {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: Uuid,
        client_id: Uuid,
        client_name: Option<String>,
        service_type: String,
        description: Option<String>,
        address: Option<String>,
        scheduled_date: NaiveDate,
        scheduled_time: Option<NaiveTime>,
        estimated_cost: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let service_type = service_type.trim().to_string();
        if service_type.is_empty() {
            return Err(DomainError::Validation("service type is required".to_string()));
        }
        if estimated_cost < Decimal::ZERO {
            return Err(DomainError::InvalidAmount(format!(
                "estimated cost cannot be negative (got {})",
                estimated_cost
            )));
        }
        // A priced booking must be payable at settlement
        if estimated_cost > Decimal::ZERO {
            Amount::new(estimated_cost)
                .map_err(|e| DomainError::InvalidAmount(format!("estimated cost: {}", e)))?;
        }

        Ok(Self {
            id,
            client_id,
            client_name,
            provider_id: None,
            provider_name: None,
            service_type,
            description,
            address,
            status: BookingStatus::Pending,
            scheduled_date,
            scheduled_time,
            estimated_cost,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancellation: None,
            provider_notes: Vec::new(),
            review: None,
            settlement: None,
        })
    }

    /// Pending and not claimed by anyone
    pub fn is_open(&self) -> bool {
        self.status == BookingStatus::Pending && self.provider_id.is_none()
    }

    pub fn ensure_client(&self, client_id: Uuid) -> Result<(), DomainError> {
        if self.client_id != client_id {
            return Err(DomainError::NotPermitted(format!(
                "booking {} belongs to another client",
                self.id
            )));
        }
        Ok(())
    }

    pub fn ensure_assigned_provider(&self, provider_id: Uuid) -> Result<(), DomainError> {
        if self.provider_id != Some(provider_id) {
            return Err(DomainError::NotPermitted(format!(
                "booking {} is not assigned to provider {}",
                self.id, provider_id
            )));
        }
        Ok(())
    }

    /// Claim an open request. Callers must hold the record version they read.
    pub fn accept(
        &mut self,
        provider_id: Uuid,
        provider_name: String,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.provider_id.is_some() {
            return Err(DomainError::AlreadyAccepted(self.id));
        }
        if self.status != BookingStatus::Pending {
            return Err(DomainError::invalid_transition(
                "booking",
                self.status,
                BookingStatus::Accepted,
            ));
        }
        self.provider_id = Some(provider_id);
        self.provider_name = Some(provider_name);
        self.status = BookingStatus::Accepted;
        self.accepted_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Provider-driven progress. Returns `false` when the booking was already
    /// in the requested status (nothing restamped).
    pub fn advance(
        &mut self,
        provider_id: Uuid,
        target: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainError> {
        self.ensure_assigned_provider(provider_id)?;

        if self.status == target
            && matches!(target, BookingStatus::InProgress | BookingStatus::Completed)
        {
            return Ok(false);
        }

        match (self.status, target) {
            (BookingStatus::Accepted, BookingStatus::InProgress) => {
                self.started_at.get_or_insert(now);
            }
            (BookingStatus::InProgress, BookingStatus::Completed) => {
                self.completed_at.get_or_insert(now);
            }
            (from, to) => return Err(DomainError::invalid_transition("booking", from, to)),
        }
        self.status = target;
        self.updated_at = now;
        Ok(true)
    }

    /// Client cancellation; returns the provider that was released, if any
    pub fn cancel(
        &mut self,
        client_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DomainError> {
        self.ensure_client(client_id)?;
        if !matches!(self.status, BookingStatus::Pending | BookingStatus::Accepted) {
            return Err(DomainError::invalid_transition(
                "booking",
                self.status,
                BookingStatus::Cancelled,
            ));
        }

        let released = self.provider_id.take();
        self.provider_name = None;
        self.status = BookingStatus::Cancelled;
        self.cancellation = Some(Cancellation {
            reason,
            cancelled_at: now,
            released_provider: released,
        });
        self.updated_at = now;
        Ok(released)
    }

    pub fn add_provider_note(
        &mut self,
        provider_id: Uuid,
        note: String,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_assigned_provider(provider_id)?;
        let note = note.trim().to_string();
        if note.is_empty() {
            return Err(DomainError::Validation("note cannot be empty".to_string()));
        }
        self.provider_notes.push(ProviderNote { note, added_at: now });
        self.updated_at = now;
        Ok(())
    }

    /// Create or edit the client's review
    pub fn rate(
        &mut self,
        client_id: Uuid,
        rating: u8,
        text: Option<String>,
        edit_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RatingChange, DomainError> {
        if !(1..=5).contains(&rating) {
            return Err(DomainError::RatingOutOfRange(rating));
        }
        self.ensure_client(client_id)?;
        if self.status != BookingStatus::Completed {
            return Err(DomainError::invalid_transition("booking", self.status, "rated"));
        }

        let change = match self.review.as_mut() {
            Some(review) => {
                if now - review.rated_at > edit_window {
                    return Err(DomainError::EditWindowExpired {
                        rated_at: review.rated_at,
                    });
                }
                review.rating = rating;
                review.text = text;
                review.last_edited_at = Some(now);
                RatingChange::Edited
            }
            None => {
                self.review = Some(Review {
                    rating,
                    text,
                    rated_at: now,
                    last_edited_at: None,
                    hidden: false,
                });
                RatingChange::Created
            }
        };
        self.updated_at = now;
        Ok(change)
    }

    /// Rating that counts towards the provider aggregate
    pub fn visible_rating(&self) -> Option<u8> {
        self.review
            .as_ref()
            .filter(|review| !review.hidden)
            .map(|review| review.rating)
    }

    /// Toggle review visibility. `None` when there is no review;
    /// otherwise whether anything changed.
    pub fn set_review_hidden(&mut self, hidden: bool, now: DateTime<Utc>) -> Option<bool> {
        let review = self.review.as_mut()?;
        if review.hidden == hidden {
            return Some(false);
        }
        review.hidden = hidden;
        self.updated_at = now;
        Some(true)
    }

    /// Drop the review entirely (admin moderation)
    pub fn remove_review(&mut self, now: DateTime<Utc>) -> Option<Review> {
        let removed = self.review.take()?;
        self.updated_at = now;
        Some(removed)
    }

    pub fn settle(&mut self, transfer_id: Uuid, now: DateTime<Utc>) -> Result<Decimal, DomainError> {
        if self.status != BookingStatus::Completed {
            return Err(DomainError::invalid_transition("booking", self.status, "settled"));
        }
        if self.settlement.is_some() {
            return Err(DomainError::AlreadySettled(self.id));
        }
        self.settlement = Some(Settlement {
            transfer_id,
            amount: self.estimated_cost,
            settled_at: now,
        });
        self.updated_at = now;
        Ok(self.estimated_cost)
    }
}
