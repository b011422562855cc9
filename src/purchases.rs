//! Recording purchases.
//!
//! Successful checkouts are the only way balances grow, apart from the
//! one-off welcome credit for new family organizations. Both are keyed by an
//! external id, so replaying a payment webhook never credits twice.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use crate::amount::validate_positive;
use crate::error::{LedgerError, Result};
use crate::ledger::{PoolRef, Transaction, TransactionLogger, TransactionType};
use crate::storage::{LedgerStore, PurchaseOutcome};

/// External id used for the welcome credit of a family organization.
#[must_use]
pub fn welcome_external_id(organization_id: &str) -> String {
    format!("welcome:{}", organization_id)
}

#[derive(Clone)]
pub struct PurchaseRecorder<S> {
    store: S,
    logger: TransactionLogger<S>,
    welcome_credit: Option<Decimal>,
}

impl<S: LedgerStore + Clone> PurchaseRecorder<S> {
    pub fn new(store: S, welcome_credit: Option<Decimal>) -> Self {
        Self {
            logger: TransactionLogger::new(store.clone()),
            store,
            welcome_credit,
        }
    }

    /// Credit `target` with a purchase identified by `external_payment_id`.
    ///
    /// Replays return the originally recorded transaction with
    /// `applied == false`.
    #[instrument(skip(self))]
    pub async fn record_purchase(
        &self,
        target: &PoolRef,
        amount: Decimal,
        external_payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome> {
        let amount = validate_positive(amount)?;
        if external_payment_id.trim().is_empty() {
            return Err(LedgerError::invalid_request("external payment id is required"));
        }
        if matches!(target, PoolRef::MemberAllocation { .. }) {
            return Err(LedgerError::invalid_request(
                "purchases credit an organization or a personal balance",
            ));
        }

        let tx = Transaction::new(
            TransactionType::Purchase,
            target,
            amount,
            format!("Credit purchase {}", external_payment_id),
            now,
        )
        .with_external_id(external_payment_id);

        self.apply(tx).await
    }

    /// Grant the configured welcome credit to a family organization, once.
    ///
    /// Returns `None` when no welcome credit is configured.
    #[instrument(skip(self))]
    pub async fn grant_welcome_credit(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PurchaseOutcome>> {
        let Some(amount) = self.welcome_credit.filter(|a| *a > Decimal::ZERO) else {
            return Ok(None);
        };

        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("organization", organization_id))?;
        if !org.is_family() {
            return Err(LedgerError::invalid_request(
                "welcome credit is only granted to family organizations",
            ));
        }

        let tx = Transaction::new(
            TransactionType::Purchase,
            &PoolRef::organization(organization_id),
            validate_positive(amount)?,
            "Family welcome credit",
            now,
        )
        .with_external_id(welcome_external_id(organization_id));

        self.apply(tx).await.map(Some)
    }

    async fn apply(&self, tx: Transaction) -> Result<PurchaseOutcome> {
        let outcome = self.store.apply_purchase(&tx).await?;
        if outcome.applied {
            self.logger.record(std::slice::from_ref(&outcome.transaction));
            info!(
                external_id = tx.external_id.as_deref().unwrap_or(""),
                amount = %tx.amount,
                new_balance = %outcome.new_balance,
                "purchase recorded"
            );
        } else {
            debug!(
                external_id = tx.external_id.as_deref().unwrap_or(""),
                original = %outcome.transaction.id,
                "duplicate purchase ignored"
            );
        }
        Ok(outcome)
    }
}
