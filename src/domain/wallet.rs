//! Wallet
//!
//! Per-account balance with a capped, append-only transaction log. The
//! balance is a scalar maintained next to the log and is never recomputed
//! from it, so pruning old entries cannot cause drift.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Amount, Balance, DomainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Credit,
    Debit,
}

/// References carried by a ledger entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

impl TransactionMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_booking(mut self, booking_id: Uuid) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    pub fn with_transfer(mut self, transfer_id: Uuid, counterparty: Uuid) -> Self {
        self.transfer_id = Some(transfer_id);
        self.counterparty = Some(counterparty);
        self
    }

    pub fn with_payment(mut self, payment_id: impl Into<String>) -> Self {
        self.payment_id = Some(payment_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Decimal,
    pub resulting_balance: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub meta: TransactionMeta,
}

impl WalletTransaction {
    /// Signed contribution to the balance
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            TransactionType::Credit => self.amount,
            TransactionType::Debit => -self.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub account_id: Uuid,
    pub balance: Balance,
    /// Most recent entries last
    pub transactions: Vec<WalletTransaction>,
    pub lifetime_credits: Decimal,
    pub lifetime_debits: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn open(account_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            balance: Balance::zero(),
            transactions: Vec::new(),
            lifetime_credits: Decimal::ZERO,
            lifetime_debits: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn credit(
        &mut self,
        amount: &Amount,
        meta: TransactionMeta,
        log_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<WalletTransaction, DomainError> {
        let balance = self
            .balance
            .credit(amount)
            .map_err(|e| DomainError::InvalidAmount(e.to_string()))?;
        self.lifetime_credits += amount.value();
        Ok(self.record(TransactionType::Credit, amount, balance, meta, log_cap, now))
    }

    pub fn debit(
        &mut self,
        amount: &Amount,
        meta: TransactionMeta,
        log_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<WalletTransaction, DomainError> {
        if !self.balance.is_sufficient_for(amount) {
            return Err(DomainError::insufficient_funds(
                amount.value(),
                self.balance.value(),
            ));
        }
        let balance = self
            .balance
            .debit(amount)
            .map_err(|e| DomainError::InvalidAmount(e.to_string()))?;
        self.lifetime_debits += amount.value();
        Ok(self.record(TransactionType::Debit, amount, balance, meta, log_cap, now))
    }

    fn record(
        &mut self,
        kind: TransactionType,
        amount: &Amount,
        balance: Balance,
        meta: TransactionMeta,
        log_cap: usize,
        now: DateTime<Utc>,
    ) -> WalletTransaction {
        self.balance = balance;
        let entry = WalletTransaction {
            id: Uuid::new_v4(),
            kind,
            amount: amount.value(),
            resulting_balance: balance.value(),
            timestamp: now,
            meta,
        };
        self.transactions.push(entry.clone());
        if self.transactions.len() > log_cap {
            let excess = self.transactions.len() - log_cap;
            self.transactions.drain(..excess);
        }
        self.updated_at = now;
        entry
    }

    /// Balance equals lifetime credits minus lifetime debits
    pub fn is_consistent(&self) -> bool {
        self.balance.value() == self.lifetime_credits - self.lifetime_debits
            && self
                .transactions
                .last()
                .map_or(true, |last| last.resulting_balance == self.balance.value())
    }
}
