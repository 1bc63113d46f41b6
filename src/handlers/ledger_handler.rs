//! Ledger Handler
//!
//! Wallet reads, admin adjustments, peer transfers and payment-backed
//! top-ups. Each operation is a single atomic commit over every wallet it
//! touches.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogBuilder};
use crate::domain::{Amount, DomainError, OperationContext, TransactionMeta, Wallet, WalletTransaction};
use crate::error::AppError;
use crate::external::PaymentVerifier;
use crate::idempotency::{IdempotencyRepository, PaymentReceipt};
use crate::store::{Changeset, Versioned};

use super::deps::{self_or_admin, HandlerDeps};
use super::{
    AdjustWalletCommand, PaymentCreditCommand, PaymentCreditResult, TransferCommand, TransferResult,
    WalletEntryResult,
};

// =========================================================================
// LedgerHandler
// =========================================================================

pub struct LedgerHandler {
    deps: HandlerDeps,
    idempotency: IdempotencyRepository,
    payments: Arc<dyn PaymentVerifier>,
}

impl LedgerHandler {
    pub fn new(deps: HandlerDeps, payments: Arc<dyn PaymentVerifier>) -> Self {
        Self {
            idempotency: IdempotencyRepository::new(deps.repo.clone()),
            deps,
            payments,
        }
    }

    async fn load_wallet(&self, account_id: Uuid) -> Result<Versioned<Wallet>, AppError> {
        let now = self.deps.clock.now();
        self.deps
            .repo
            .load_or_else(account_id, || Wallet::open(account_id, now))
            .await
    }

    /// Stored wallet, or an empty one for an account that never transacted
    pub async fn get_wallet(&self, account_id: Uuid, context: &OperationContext) -> Result<Wallet, AppError> {
        self_or_admin(context, account_id)?;
        Ok(self.load_wallet(account_id).await?.record)
    }

    // =========================================================================
    // Single-wallet entries
    // =========================================================================

    /// Add funds to one wallet
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: &Amount,
        meta: TransactionMeta,
    ) -> Result<WalletEntryResult, AppError> {
        let log_cap = self.deps.settings.wallet_log_cap;
        let now = self.deps.clock.now();

        let (wallet, transaction) = self
            .deps
            .repo
            .upsert::<Wallet, _, _, _>(
                account_id,
                || Wallet::open(account_id, now),
                |wallet| {
                    wallet
                        .credit(amount, meta.clone(), log_cap, now)
                        .map_err(AppError::from)
                },
            )
            .await?;

        tracing::info!(%account_id, amount = %amount, balance = %wallet.balance, "Wallet credited");
        Ok(entry_result(&wallet, transaction))
    }

    /// Remove funds from one wallet; never below zero
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: &Amount,
        meta: TransactionMeta,
    ) -> Result<WalletEntryResult, AppError> {
        let log_cap = self.deps.settings.wallet_log_cap;
        let now = self.deps.clock.now();

        let (wallet, transaction) = self
            .deps
            .repo
            .upsert::<Wallet, _, _, _>(
                account_id,
                || Wallet::open(account_id, now),
                |wallet| {
                    wallet
                        .debit(amount, meta.clone(), log_cap, now)
                        .map_err(AppError::from)
                },
            )
            .await?;

        tracing::info!(%account_id, amount = %amount, balance = %wallet.balance, "Wallet debited");
        Ok(entry_result(&wallet, transaction))
    }

    /// Admin balance adjustment, audited
    pub async fn admin_adjust(
        &self,
        account_id: Uuid,
        command: AdjustWalletCommand,
        credit: bool,
        context: &OperationContext,
    ) -> Result<WalletEntryResult, AppError> {
        context.require_admin()?;
        let amount = parse_amount(&command.amount)?;
        let description = command.description.trim().to_string();
        if description.is_empty() {
            return Err(AppError::InvalidArgument("description is required".to_string()));
        }
        let meta = TransactionMeta::new(description);

        let (result, action) = if credit {
            (self.credit(account_id, &amount, meta).await?, AuditAction::WalletCredited)
        } else {
            (self.debit(account_id, &amount, meta).await?, AuditAction::WalletDebited)
        };

        self.deps
            .audit
            .record(
                AuditLogBuilder::new(action)
                    .resource("wallet", account_id)
                    .after_state(&result.transaction),
                context,
            )
            .await;
        Ok(result)
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Move money between two wallets in one commit. A failed debit leaves
    /// both wallets untouched.
    pub async fn transfer(
        &self,
        from_account_id: Uuid,
        command: TransferCommand,
        context: &OperationContext,
    ) -> Result<TransferResult, AppError> {
        let caller = context.caller()?;
        if caller.user_id != from_account_id {
            return Err(AppError::Forbidden(format!(
                "caller {} cannot spend from wallet {}",
                caller.user_id, from_account_id
            )));
        }
        if command.to_account_id == from_account_id {
            return Err(DomainError::SameAccountTransfer.into());
        }
        let amount = parse_amount(&command.amount)?;
        let to_account_id = command.to_account_id;
        let memo = command.memo.unwrap_or_else(|| "Transfer".to_string());
        let log_cap = self.deps.settings.wallet_log_cap;

        let result = self
            .deps
            .repo
            .retry("ledger.transfer", || {
                let memo = memo.clone();
                async move {
                    let now = self.deps.clock.now();
                    let transfer_id = Uuid::new_v4();
                    let loaded_from = self.load_wallet(from_account_id).await?;
                    let loaded_to = self.load_wallet(to_account_id).await?;

                    let mut from = loaded_from.record.clone();
                    from.debit(
                        &amount,
                        TransactionMeta::new(memo.clone()).with_transfer(transfer_id, to_account_id),
                        log_cap,
                        now,
                    )?;
                    let mut to = loaded_to.record.clone();
                    to.credit(
                        &amount,
                        TransactionMeta::new(memo).with_transfer(transfer_id, from_account_id),
                        log_cap,
                        now,
                    )?;

                    let mut changes = Changeset::new();
                    changes.save(&loaded_from, &from)?.save(&loaded_to, &to)?;
                    self.deps.repo.commit(changes).await?;

                    Ok(TransferResult {
                        transfer_id,
                        from_account_id,
                        to_account_id,
                        amount: amount.value(),
                        from_balance: from.balance.value(),
                    })
                }
            })
            .await?;

        tracing::info!(
            transfer_id = %result.transfer_id,
            from = %from_account_id,
            to = %to_account_id,
            amount = %amount,
            "Transfer completed"
        );
        Ok(result)
    }

    // =========================================================================
    // Payment top-up
    // =========================================================================

    /// Credit a wallet from a gateway payment. The signature is checked
    /// first; the payment id is stored as a receipt in the same commit as
    /// the credit, so each payment credits once.
    pub async fn credit_from_payment(
        &self,
        account_id: Uuid,
        command: PaymentCreditCommand,
        context: &OperationContext,
    ) -> Result<PaymentCreditResult, AppError> {
        self_or_admin(context, account_id)?;
        let amount = parse_amount(&command.amount)?;
        let order_id = command.order_id.trim().to_string();
        let payment_id = command.payment_id.trim().to_string();
        if order_id.is_empty() || payment_id.is_empty() {
            return Err(AppError::InvalidArgument(
                "order id and payment id are required".to_string(),
            ));
        }

        let valid = self
            .payments
            .verify_signature(&order_id, &payment_id, &command.signature)
            .await
            .map_err(|err| match err {
                upstream @ AppError::UpstreamFailure(_) => upstream,
                other => AppError::UpstreamFailure(format!("payment verification failed: {}", other)),
            })?;
        if !valid {
            tracing::warn!(%account_id, %order_id, %payment_id, "Payment signature rejected");
            return Err(AppError::Forbidden("invalid payment signature".to_string()));
        }

        let request_hash =
            IdempotencyRepository::payment_request_hash(account_id, amount.value(), &order_id, &payment_id);
        let log_cap = self.deps.settings.wallet_log_cap;

        let result = self
            .deps
            .repo
            .retry("ledger.credit_from_payment", || {
                let (order_id, payment_id, request_hash) =
                    (order_id.clone(), payment_id.clone(), request_hash.clone());
                async move {
                    let loaded = self.load_wallet(account_id).await?;
                    if let Some(receipt) = self.idempotency.check(&payment_id, &request_hash).await? {
                        return Ok(PaymentCreditResult {
                            payment_id,
                            transaction_id: receipt.transaction_id,
                            amount: receipt.amount,
                            balance: loaded.record.balance.value(),
                            already_processed: true,
                        });
                    }

                    let now = self.deps.clock.now();
                    let mut wallet = loaded.record.clone();
                    let transaction = wallet.credit(
                        &amount,
                        TransactionMeta::new("Wallet top-up").with_payment(payment_id.clone()),
                        log_cap,
                        now,
                    )?;

                    let mut changes = Changeset::new();
                    changes.save(&loaded, &wallet)?;
                    IdempotencyRepository::stage(
                        &mut changes,
                        &PaymentReceipt {
                            payment_id: payment_id.clone(),
                            order_id,
                            account_id,
                            amount: amount.value(),
                            request_hash,
                            transaction_id: transaction.id,
                            credited_at: now,
                        },
                    )?;
                    self.deps.repo.commit(changes).await?;

                    Ok(PaymentCreditResult {
                        payment_id,
                        transaction_id: transaction.id,
                        amount: amount.value(),
                        balance: wallet.balance.value(),
                        already_processed: false,
                    })
                }
            })
            .await?;

        if result.already_processed {
            tracing::info!(%account_id, %payment_id, "Payment already credited, replay ignored");
        } else {
            tracing::info!(%account_id, %payment_id, amount = %amount, "Payment credited");
            self.deps
                .audit
                .record(
                    AuditLogBuilder::new(AuditAction::PaymentCredited)
                        .resource("wallet", account_id)
                        .after_state(&result),
                    context,
                )
                .await;
        }
        Ok(result)
    }
}

fn parse_amount(raw: &str) -> Result<Amount, AppError> {
    raw.parse()
        .map_err(|e| AppError::InvalidArgument(format!("Invalid amount: {}", e)))
}

fn entry_result(wallet: &Wallet, transaction: WalletTransaction) -> WalletEntryResult {
    WalletEntryResult {
        account_id: wallet.account_id,
        balance: wallet.balance.value(),
        transaction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::EngineSettings;
    use crate::domain::{Identity, Role};
    use crate::error::ErrorKind;
    use crate::external::HmacPaymentVerifier;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    const SECRET: &str = "test-payment-secret";

    fn handler() -> LedgerHandler {
        let deps = HandlerDeps::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            EngineSettings::default(),
        );
        LedgerHandler::new(deps, Arc::new(HmacPaymentVerifier::new(SECRET)))
    }

    fn as_client(id: Uuid) -> OperationContext {
        OperationContext::for_caller(Identity::new(id, Role::Client))
    }

    fn amount(raw: &str) -> Amount {
        raw.parse().unwrap()
    }

    fn topup(order: &str, payment: &str, amount: &str) -> PaymentCreditCommand {
        PaymentCreditCommand {
            amount: amount.to_string(),
            order_id: order.to_string(),
            payment_id: payment.to_string(),
            signature: HmacPaymentVerifier::new(SECRET).sign(order, payment).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_unknown_wallet_reads_empty() {
        let ledger = handler();
        let account = Uuid::new_v4();
        let wallet = ledger.get_wallet(account, &as_client(account)).await.unwrap();
        assert_eq!(wallet.balance.value(), dec!(0));
        assert!(wallet.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_debit_beyond_balance() {
        let ledger = handler();
        let account = Uuid::new_v4();
        ledger
            .credit(account, &amount("500"), TransactionMeta::new("top-up"))
            .await
            .unwrap();

        let err = ledger
            .debit(account, &amount("700"), TransactionMeta::new("booking"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let wallet = ledger.get_wallet(account, &as_client(account)).await.unwrap();
        assert_eq!(wallet.balance.value(), dec!(500));
    }

    #[tokio::test]
    async fn test_transfer_is_all_or_nothing() {
        let ledger = handler();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger
            .credit(alice, &amount("300"), TransactionMeta::new("top-up"))
            .await
            .unwrap();

        let result = ledger
            .transfer(alice, TransferCommand::new(bob, "120.50"), &as_client(alice))
            .await
            .unwrap();
        assert_eq!(result.from_balance, dec!(179.50));

        let err = ledger
            .transfer(alice, TransferCommand::new(bob, "500"), &as_client(alice))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let a = ledger.get_wallet(alice, &as_client(alice)).await.unwrap();
        let b = ledger.get_wallet(bob, &as_client(bob)).await.unwrap();
        assert_eq!(a.balance.value() + b.balance.value(), dec!(300));
        assert!(a.is_consistent() && b.is_consistent());
    }

    #[tokio::test]
    async fn test_transfer_guards() {
        let ledger = handler();
        let alice = Uuid::new_v4();

        let err = ledger
            .transfer(alice, TransferCommand::new(alice, "10"), &as_client(alice))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = ledger
            .transfer(alice, TransferCommand::new(Uuid::new_v4(), "0"), &as_client(alice))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = ledger
            .transfer(alice, TransferCommand::new(Uuid::new_v4(), "10"), &as_client(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_payment_credits_once() {
        let ledger = handler();
        let account = Uuid::new_v4();

        let first = ledger
            .credit_from_payment(account, topup("order_1", "pay_1", "500"), &as_client(account))
            .await
            .unwrap();
        assert!(!first.already_processed);
        assert_eq!(first.balance, dec!(500));

        let replay = ledger
            .credit_from_payment(account, topup("order_1", "pay_1", "500"), &as_client(account))
            .await
            .unwrap();
        assert!(replay.already_processed);
        assert_eq!(replay.transaction_id, first.transaction_id);
        assert_eq!(replay.balance, dec!(500));

        // same payment id, different amount
        let err = ledger
            .credit_from_payment(account, topup("order_1", "pay_1", "900"), &as_client(account))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_bad_signature_forbidden() {
        let ledger = handler();
        let account = Uuid::new_v4();
        let mut command = topup("order_2", "pay_2", "500");
        command.signature = "00ff".to_string();

        let err = ledger
            .credit_from_payment(account, command, &as_client(account))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let wallet = ledger.get_wallet(account, &as_client(account)).await.unwrap();
        assert_eq!(wallet.balance.value(), dec!(0));
    }

    #[tokio::test]
    async fn test_admin_adjustment_requires_admin() {
        let ledger = handler();
        let account = Uuid::new_v4();
        let command = AdjustWalletCommand {
            amount: "250".to_string(),
            description: "goodwill credit".to_string(),
        };

        let err = ledger
            .admin_adjust(account, command.clone(), true, &as_client(account))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let admin = OperationContext::for_caller(Identity::new(Uuid::new_v4(), Role::Admin));
        let result = ledger.admin_adjust(account, command, true, &admin).await.unwrap();
        assert_eq!(result.balance, dec!(250));
    }
}
