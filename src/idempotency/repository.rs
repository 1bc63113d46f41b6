//! Idempotency Repository
//!
//! Payment receipts keyed by the gateway's payment id. A receipt is written
//! with an "absent" precondition in the same commit as the wallet credit, so
//! two deliveries of one payment can never both land.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{Changeset, ExpectedVersion, Repository, StoreError};

const PAYMENT_PREFIX: &str = "idem:payment:";

/// Stored proof that a payment was credited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub order_id: String,
    pub account_id: Uuid,
    pub amount: Decimal,
    pub request_hash: String,
    pub transaction_id: Uuid,
    pub credited_at: DateTime<Utc>,
}

impl PaymentReceipt {
    pub fn key(payment_id: &str) -> String {
        format!("{}{}", PAYMENT_PREFIX, payment_id)
    }
}

/// Repository for payment idempotency receipts
#[derive(Debug, Clone)]
pub struct IdempotencyRepository {
    repo: Repository,
}

impl IdempotencyRepository {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn get(&self, payment_id: &str) -> Result<Option<PaymentReceipt>, AppError> {
        let key = PaymentReceipt::key(payment_id);
        match self.repo.store().get(&key).await? {
            Some(stored) => {
                let receipt = serde_json::from_value(stored.value).map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                })?;
                Ok(Some(receipt))
            }
            None => Ok(None),
        }
    }

    /// Existing receipt for a replayed payment. A receipt whose request hash
    /// differs means the payment id was reused for a different credit.
    pub async fn check(
        &self,
        payment_id: &str,
        request_hash: &str,
    ) -> Result<Option<PaymentReceipt>, AppError> {
        match self.get(payment_id).await? {
            Some(existing) if existing.request_hash != request_hash => Err(AppError::Conflict(
                format!("payment {} already applied to a different credit", payment_id),
            )),
            other => Ok(other),
        }
    }

    /// Add the receipt to a changeset; the commit fails if it already exists
    pub fn stage(changes: &mut Changeset, receipt: &PaymentReceipt) -> Result<(), AppError> {
        changes.put(
            PaymentReceipt::key(&receipt.payment_id),
            serde_json::to_value(receipt)?,
            ExpectedVersion::Absent,
        );
        Ok(())
    }

    /// Compute SHA-256 hash of the request for conflict detection
    pub fn compute_request_hash(body: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    /// Hash of the fields that identify one payment credit
    pub fn payment_request_hash(account_id: Uuid, amount: Decimal, order_id: &str, payment_id: &str) -> String {
        let canonical = format!("{}|{}|{}|{}", account_id, amount.normalize(), order_id, payment_id);
        Self::compute_request_hash(canonical.as_bytes())
    }
}
