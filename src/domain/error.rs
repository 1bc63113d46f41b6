//! Domain Error Types
//!
//! Pure domain errors that don't depend on infrastructure.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Domain-specific errors
///
/// These errors represent business rule violations and invariant failures
/// raised by the entity methods. They are independent of the web/storage layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// Debit exceeds the wallet balance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Invalid amount (zero, negative, or exceeds limit)
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Transfer to same account
    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,

    /// Stage id outside 1..=4
    #[error("Unknown verification stage: {0}")]
    UnknownStage(u8),

    /// Status machine rejected the move
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Stage ordering is enforced and a previous stage is not approved yet
    #[error("Stage {stage} requires stage {required} to be approved first")]
    StageOutOfOrder { stage: u8, required: u8 },

    /// Request already claimed by a provider
    #[error("Request {0} has already been accepted")]
    AlreadyAccepted(Uuid),

    /// Provider is not allowed to take work
    #[error("Provider {provider_id} is not eligible: {reason}")]
    NotEligible { provider_id: Uuid, reason: String },

    /// Caller does not own the resource
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Rating outside 1..=5
    #[error("Rating must be between 1 and 5 (got {0})")]
    RatingOutOfRange(u8),

    /// Rating edit window has closed
    #[error("Review edit window expired (rated at {rated_at})")]
    EditWindowExpired { rated_at: DateTime<Utc> },

    /// Booking has already been paid out
    #[error("Booking {0} has already been settled")]
    AlreadySettled(Uuid),

    /// Required field missing or malformed
    #[error("Validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    /// Create an insufficient funds error
    pub fn insufficient_funds(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientFunds { required, available }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn not_eligible(provider_id: Uuid, reason: impl Into<String>) -> Self {
        Self::NotEligible {
            provider_id,
            reason: reason.into(),
        }
    }

    /// Map onto the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::InvalidAmount(_)
            | Self::SameAccountTransfer
            | Self::UnknownStage(_)
            | Self::RatingOutOfRange(_)
            | Self::Validation(_) => ErrorKind::InvalidArgument,
            Self::InvalidTransition { .. }
            | Self::StageOutOfOrder { .. }
            | Self::AlreadyAccepted(_)
            | Self::AlreadySettled(_) => ErrorKind::Conflict,
            Self::NotEligible { .. } | Self::NotPermitted(_) | Self::EditWindowExpired { .. } => {
                ErrorKind::Forbidden
            }
        }
    }

    /// Check if this is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::Forbidden | ErrorKind::InsufficientFunds
        )
    }

    /// Check if this is a state conflict
    pub fn is_conflict_error(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_error() {
        let err = DomainError::insufficient_funds(Decimal::new(700, 0), Decimal::new(500, 0));

        assert!(err.is_client_error());
        assert!(!err.is_conflict_error());
        assert!(err.to_string().contains("700"));
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_already_accepted_is_conflict() {
        let err = DomainError::AlreadyAccepted(Uuid::new_v4());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_conflict_error());
    }

    #[test]
    fn test_edit_window_is_forbidden() {
        let err = DomainError::EditWindowExpired { rated_at: Utc::now() };
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = DomainError::invalid_transition("booking", "completed", "cancelled");
        assert_eq!(
            err.to_string(),
            "Invalid transition for booking: completed -> cancelled"
        );
    }
}
