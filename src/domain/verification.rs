//! Verification record
//!
//! Per-provider four-stage verification state machine. Each stage moves
//! `pending -> submitted -> approved | rejected`; the only way back from a
//! decided stage is the bulk reset performed by an admin unapprove.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DomainError;

/// One of the four verification checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StageId {
    /// Identity and contact details
    Identity = 1,
    /// Uploaded documents
    Documents = 2,
    /// Skills and experience
    Skills = 3,
    /// Behavioral assessment
    Behavioral = 4,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::Identity,
        StageId::Documents,
        StageId::Skills,
        StageId::Behavioral,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    /// Stage that must be approved first when ordering is enforced
    pub fn previous(self) -> Option<StageId> {
        match self {
            StageId::Identity => None,
            StageId::Documents => Some(StageId::Identity),
            StageId::Skills => Some(StageId::Documents),
            StageId::Behavioral => Some(StageId::Skills),
        }
    }
}

impl TryFrom<u8> for StageId {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StageId::Identity),
            2 => Ok(StageId::Documents),
            3 => Ok(StageId::Skills),
            4 => Ok(StageId::Behavioral),
            other => Err(DomainError::UnknownStage(other)),
        }
    }
}

impl From<StageId> for u8 {
    fn from(stage: StageId) -> Self {
        stage.number()
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Submitted,
    Approved,
    Rejected,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Submitted => write!(f, "submitted"),
            StageStatus::Approved => write!(f, "approved"),
            StageStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Admin decision on a submitted stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
}

impl ReviewAction {
    fn outcome(self) -> StageStatus {
        match self {
            ReviewAction::Approve => StageStatus::Approved,
            ReviewAction::Reject => StageStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewNote {
    pub action: ReviewAction,
    pub notes: Option<String>,
    pub reviewer_id: Uuid,
    pub reviewed_at: DateTime<Utc>,
}

/// Overall result derived from the four stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Every stage approved
    Approved,
    /// At least one stage rejected
    Rejected,
    /// Anything else: still waiting on submissions or reviews
    InReview,
}

/// Verification record, one per provider (keyed by provider id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub provider_id: Uuid,
    pub stages: BTreeMap<StageId, StageStatus>,
    #[serde(default)]
    pub stage_data: BTreeMap<StageId, serde_json::Value>,
    #[serde(default)]
    pub review_notes: BTreeMap<StageId, ReviewNote>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationRecord {
    /// Seed a record at signup. Stages with signup data start as `submitted`.
    pub fn seed(
        provider_id: Uuid,
        signup_data: BTreeMap<StageId, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let stages = StageId::ALL
            .iter()
            .map(|stage| {
                let status = if signup_data.contains_key(stage) {
                    StageStatus::Submitted
                } else {
                    StageStatus::Pending
                };
                (*stage, status)
            })
            .collect();

        Self {
            provider_id,
            stages,
            stage_data: signup_data,
            review_notes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self, stage: StageId) -> StageStatus {
        self.stages
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    fn check_order(&self, stage: StageId, enforce_order: bool) -> Result<(), DomainError> {
        if !enforce_order {
            return Ok(());
        }
        match stage.previous() {
            Some(prev) if self.status(prev) != StageStatus::Approved => {
                Err(DomainError::StageOutOfOrder {
                    stage: stage.number(),
                    required: prev.number(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Provider submits (or resubmits) data for a stage
    pub fn submit(
        &mut self,
        stage: StageId,
        data: serde_json::Value,
        enforce_order: bool,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let current = self.status(stage);
        if !matches!(current, StageStatus::Pending | StageStatus::Submitted) {
            return Err(DomainError::invalid_transition(
                "verification stage",
                current,
                StageStatus::Submitted,
            ));
        }
        self.check_order(stage, enforce_order)?;

        self.stages.insert(stage, StageStatus::Submitted);
        self.stage_data.insert(stage, data);
        self.updated_at = now;
        Ok(())
    }

    /// Admin approves or rejects a submitted stage
    pub fn review(
        &mut self,
        stage: StageId,
        action: ReviewAction,
        notes: Option<String>,
        reviewer_id: Uuid,
        enforce_order: bool,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome, DomainError> {
        let current = self.status(stage);
        let target = action.outcome();
        if current != StageStatus::Submitted {
            return Err(DomainError::invalid_transition("verification stage", current, target));
        }
        if action == ReviewAction::Approve {
            self.check_order(stage, enforce_order)?;
        }

        self.stages.insert(stage, target);
        self.review_notes.insert(
            stage,
            ReviewNote {
                action,
                notes,
                reviewer_id,
                reviewed_at: now,
            },
        );
        self.updated_at = now;
        Ok(self.outcome())
    }

    /// Send every stage back to the review queue
    pub fn reset_for_review(&mut self, now: DateTime<Utc>) {
        for stage in StageId::ALL {
            self.stages.insert(stage, StageStatus::Submitted);
        }
        self.updated_at = now;
    }

    pub fn outcome(&self) -> VerificationOutcome {
        if StageId::ALL
            .iter()
            .all(|s| self.status(*s) == StageStatus::Approved)
        {
            VerificationOutcome::Approved
        } else if StageId::ALL
            .iter()
            .any(|s| self.status(*s) == StageStatus::Rejected)
        {
            VerificationOutcome::Rejected
        } else {
            VerificationOutcome::InReview
        }
    }

    /// At least one stage waits for an admin decision
    pub fn awaiting_review(&self) -> bool {
        self.stages.values().any(|s| *s == StageStatus::Submitted)
    }

    /// Stages in the order they appear to the provider
    pub fn stage_summary(&self) -> Vec<(StageId, StageStatus)> {
        StageId::ALL.iter().map(|s| (*s, self.status(*s))).collect()
    }
}
