//! Usage Debiter.
//!
//! Charges a resolved pool for completed usage. The debit is a single
//! conditional decrement in the store, so two concurrent debits can never
//! both pass against a remainder that only covers one of them. No pricing
//! happens here; the amount arrives already computed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};

use crate::amount::validate_positive;
use crate::error::{LedgerError, Result};
use crate::ledger::{PoolRef, Transaction, TransactionLogger, TransactionType};
use crate::storage::LedgerStore;

/// A successful debit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DebitOutcome {
    pub transaction: Transaction,
    /// The pool's remainder after the debit.
    pub remaining: Decimal,
}

/// A successful reversal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReversalOutcome {
    pub transaction: Transaction,
    pub new_balance: Decimal,
}

#[derive(Clone)]
pub struct UsageDebiter<S> {
    store: S,
    logger: TransactionLogger<S>,
}

impl<S: LedgerStore + Clone> UsageDebiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            logger: TransactionLogger::new(store.clone()),
            store,
        }
    }

    /// Subtract `amount` from `pool` and log a `usage` transaction for
    /// `user_id`.
    #[instrument(skip(self, description))]
    pub async fn debit(
        &self,
        pool: &PoolRef,
        amount: Decimal,
        user_id: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome> {
        let amount = validate_positive(amount)?;
        let tx = Transaction::new(TransactionType::Usage, pool, -amount, description, now)
            .with_user(user_id);

        let remaining = self.store.apply_debit(&tx).await?;
        self.logger.record(std::slice::from_ref(&tx));

        info!(
            pool = %pool,
            amount = %amount,
            remaining = %remaining,
            transaction_id = %tx.id,
            "usage debited"
        );

        Ok(DebitOutcome {
            transaction: tx,
            remaining,
        })
    }

    /// Return a usage debit to the pool it was taken from.
    ///
    /// Each usage row can be reversed once.
    #[instrument(skip(self))]
    pub async fn reverse(
        &self,
        transaction_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ReversalOutcome> {
        let original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("transaction", transaction_id))?;

        if original.tx_type != TransactionType::Usage {
            return Err(LedgerError::invalid_request(format!(
                "only usage can be reversed, {} is a {}",
                original.id, original.tx_type
            )));
        }
        let pool = original.pool_ref().ok_or_else(|| {
            LedgerError::inconsistency(format!("usage {} has no pool identity", original.id))
        })?;

        let mut tx = Transaction::new(
            TransactionType::Reversal,
            &pool,
            -original.amount,
            format!("Reversal of {}: {}", original.id, reason),
            now,
        )
        .with_reverses(&original.id);
        tx.organization_id = original.organization_id.clone();
        tx.member_id = original.member_id.clone();
        tx.user_id = original.user_id.clone();

        let new_balance = self.store.apply_reversal(&tx).await?;
        self.logger.record(std::slice::from_ref(&tx));

        info!(
            pool = %pool,
            amount = %tx.amount,
            reverses = %original.id,
            "usage reversed"
        );

        Ok(ReversalOutcome {
            transaction: tx,
            new_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PoolKind;
    use crate::storage::InMemoryLedgerStore;
    use crate::types::Profile;

    #[tokio::test]
    async fn test_debit_and_reverse_personal() {
        let store = InMemoryLedgerStore::new();
        store
            .save_profile(&Profile::new("u1").with_balance(Decimal::new(100, 2)))
            .await
            .unwrap();
        let debiter = UsageDebiter::new(store.clone());
        let pool = PoolRef::personal("u1");

        let outcome = debiter
            .debit(&pool, Decimal::new(25, 2), "u1", "chat", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.remaining, Decimal::new(75, 2));
        assert_eq!(outcome.transaction.amount, Decimal::new(-25, 2));
        assert_eq!(outcome.transaction.pool, PoolKind::Personal);

        let reversal = debiter
            .reverse(&outcome.transaction.id, "provider error", Utc::now())
            .await
            .unwrap();
        assert_eq!(reversal.new_balance, Decimal::new(100, 2));
        assert_eq!(
            reversal.transaction.reverses.as_deref(),
            Some(outcome.transaction.id.as_str())
        );

        assert!(matches!(
            debiter
                .reverse(&outcome.transaction.id, "again", Utc::now())
                .await,
            Err(LedgerError::AlreadyReversed { .. })
        ));
    }

    #[tokio::test]
    async fn test_debit_rejects_non_positive() {
        let debiter = UsageDebiter::new(InMemoryLedgerStore::new());
        let result = debiter
            .debit(&PoolRef::personal("u1"), Decimal::ZERO, "u1", "chat", Utc::now())
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount { .. })));
    }

    #[tokio::test]
    async fn test_only_usage_is_reversible() {
        let store = InMemoryLedgerStore::new();
        store.save_profile(&Profile::new("u1")).await.unwrap();
        let purchase = Transaction::new(
            TransactionType::Purchase,
            &PoolRef::personal("u1"),
            Decimal::ONE,
            "buy",
            Utc::now(),
        );
        store.apply_purchase(&purchase).await.unwrap();

        let debiter = UsageDebiter::new(store);
        assert!(matches!(
            debiter.reverse(&purchase.id, "nope", Utc::now()).await,
            Err(LedgerError::InvalidRequest { .. })
        ));
    }
}
