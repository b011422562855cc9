//! Transactions and the append-only transaction log.
//!
//! Every balance change in the system is explained by exactly one
//! [`Transaction`] written in the same atomic store operation as the change.
//! Transactions are never updated or deleted; corrections are new
//! `reversal` rows pointing at the transaction they undo.
//!
//! Summing the transactions of a pool reproduces that pool's balance, see
//! [`pool_delta`] and [`TransactionLogger::reconcile`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::storage::LedgerStore;
use crate::types::string_enum;

string_enum! {
    /// What kind of ledger event a transaction records.
    pub enum TransactionType ("transaction type") {
        Purchase => "purchase",
        CreditAllocated => "credit_allocated",
        Usage => "usage",
        Transfer => "transfer",
        Reversal => "reversal",
    }
}

string_enum! {
    /// The class of pool a transaction amount applies to.
    pub enum PoolKind ("pool kind") {
        Organization => "organization",
        MemberAllocation => "member_allocation",
        Personal => "personal",
    }
}

/// A concrete credit pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolRef {
    /// An organization's unallocated credit.
    Organization { organization_id: String },
    /// One member's slice of the organization pool.
    MemberAllocation {
        organization_id: String,
        member_id: String,
    },
    /// A user's personal balance.
    Personal { user_id: String },
}

impl PoolRef {
    pub fn organization(organization_id: impl Into<String>) -> Self {
        Self::Organization {
            organization_id: organization_id.into(),
        }
    }

    pub fn member(organization_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self::MemberAllocation {
            organization_id: organization_id.into(),
            member_id: member_id.into(),
        }
    }

    pub fn personal(user_id: impl Into<String>) -> Self {
        Self::Personal {
            user_id: user_id.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> PoolKind {
        match self {
            Self::Organization { .. } => PoolKind::Organization,
            Self::MemberAllocation { .. } => PoolKind::MemberAllocation,
            Self::Personal { .. } => PoolKind::Personal,
        }
    }

    #[must_use]
    pub fn organization_id(&self) -> Option<&str> {
        match self {
            Self::Organization { organization_id }
            | Self::MemberAllocation {
                organization_id, ..
            } => Some(organization_id),
            Self::Personal { .. } => None,
        }
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Organization { organization_id } => write!(f, "organization:{}", organization_id),
            Self::MemberAllocation {
                organization_id,
                member_id,
            } => write!(f, "member:{}/{}", organization_id, member_id),
            Self::Personal { user_id } => write!(f, "personal:{}", user_id),
        }
    }
}

/// An immutable ledger record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub organization_id: Option<String>,
    pub member_id: Option<String>,
    pub user_id: Option<String>,
    pub tx_type: TransactionType,
    pub pool: PoolKind,
    /// Signed change to `pool`. Usage is negative.
    pub amount: Decimal,
    pub description: String,
    /// Idempotency key from the payment provider.
    pub external_id: Option<String>,
    /// For reversals, the transaction being corrected.
    pub reverses: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a transaction applying `amount` to `pool`.
    pub fn new(
        tx_type: TransactionType,
        pool: &PoolRef,
        amount: Decimal,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (organization_id, member_id, user_id) = match pool {
            PoolRef::Organization { organization_id } => (Some(organization_id.clone()), None, None),
            PoolRef::MemberAllocation {
                organization_id,
                member_id,
            } => (Some(organization_id.clone()), Some(member_id.clone()), None),
            PoolRef::Personal { user_id } => (None, None, Some(user_id.clone())),
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id,
            member_id,
            user_id,
            tx_type,
            pool: pool.kind(),
            amount,
            description: description.into(),
            external_id: None,
            reverses: None,
            created_at: now,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    #[must_use]
    pub fn with_reverses(mut self, transaction_id: impl Into<String>) -> Self {
        self.reverses = Some(transaction_id.into());
        self
    }

    /// Reconstruct the pool this transaction's amount applies to.
    #[must_use]
    pub fn pool_ref(&self) -> Option<PoolRef> {
        match self.pool {
            PoolKind::Organization => self.organization_id.clone().map(PoolRef::organization),
            PoolKind::MemberAllocation => match (&self.organization_id, &self.member_id) {
                (Some(org), Some(member)) => Some(PoolRef::member(org, member)),
                _ => None,
            },
            PoolKind::Personal => self.user_id.clone().map(PoolRef::personal),
        }
    }

    /// Whether this row moved credit out of the organization's unallocated
    /// pool into a member allocation or a child's balance.
    #[must_use]
    pub fn draws_on_org_pool(&self) -> bool {
        matches!(
            self.tx_type,
            TransactionType::CreditAllocated | TransactionType::Transfer
        ) && self.pool != PoolKind::Organization
    }
}

/// Filter for transaction listings. Empty filters match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionQuery {
    pub organization_id: Option<String>,
    pub member_id: Option<String>,
    pub user_id: Option<String>,
    pub tx_type: Option<TransactionType>,
    pub pool: Option<PoolKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

impl TransactionQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    #[must_use]
    pub fn member(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn tx_type(mut self, tx_type: TransactionType) -> Self {
        self.tx_type = Some(tx_type);
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: PoolKind) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-process filter, used by the in-memory store.
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        fn eq(filter: &Option<String>, value: &Option<String>) -> bool {
            filter.as_ref().is_none_or(|f| value.as_deref() == Some(f.as_str()))
        }

        eq(&self.organization_id, &tx.organization_id)
            && eq(&self.member_id, &tx.member_id)
            && eq(&self.user_id, &tx.user_id)
            && self.tx_type.is_none_or(|t| t == tx.tx_type)
            && self.pool.is_none_or(|p| p == tx.pool)
            && self.since.is_none_or(|s| tx.created_at >= s)
            && self.until.is_none_or(|u| tx.created_at < u)
    }
}

/// Net effect of `transactions` on `pool`.
///
/// For an organization this is the unallocated pool: everything applied to
/// the organization pool minus what was allocated or transferred out of it.
#[must_use]
pub fn pool_delta<'a, I>(pool: &PoolRef, transactions: I) -> Decimal
where
    I: IntoIterator<Item = &'a Transaction>,
{
    transactions
        .into_iter()
        .map(|tx| match pool {
            PoolRef::Organization { organization_id } => {
                if tx.organization_id.as_deref() != Some(organization_id.as_str()) {
                    Decimal::ZERO
                } else if tx.pool == PoolKind::Organization {
                    tx.amount
                } else if tx.draws_on_org_pool() {
                    -tx.amount
                } else {
                    Decimal::ZERO
                }
            }
            _ if tx.pool_ref().as_ref() == Some(pool) => tx.amount,
            _ => Decimal::ZERO,
        })
        .sum()
}

/// Result of comparing a pool's stored balance with its transaction history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub pool: PoolRef,
    pub stored_balance: Decimal,
    pub ledger_balance: Decimal,
}

impl Reconciliation {
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.stored_balance == self.ledger_balance
    }

    #[must_use]
    pub fn drift(&self) -> Decimal {
        self.stored_balance - self.ledger_balance
    }
}

/// Read side of the transaction log, plus the audit mirror.
///
/// Writes happen inside the store's atomic mutations; this type never
/// appends on its own. After a mutation commits, [`TransactionLogger::record`]
/// mirrors the new rows to the `creditgate::audit` tracing target.
#[derive(Clone)]
pub struct TransactionLogger<S> {
    store: S,
}

impl<S: LedgerStore> TransactionLogger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Emit committed transactions to the audit trail.
    pub fn record(&self, transactions: &[Transaction]) {
        for tx in transactions {
            tracing::info!(
                target: "creditgate::audit",
                transaction_id = %tx.id,
                tx_type = tx.tx_type.as_str(),
                pool = tx.pool.as_str(),
                amount = %tx.amount,
                organization_id = tx.organization_id.as_deref().unwrap_or(""),
                member_id = tx.member_id.as_deref().unwrap_or(""),
                user_id = tx.user_id.as_deref().unwrap_or(""),
                reverses = tx.reverses.as_deref().unwrap_or(""),
                "{}",
                tx.description
            );
        }
    }

    pub async fn get(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        self.store.get_transaction(transaction_id).await
    }

    /// Transactions matching `query`, oldest first.
    pub async fn list(&self, query: &TransactionQuery) -> Result<Vec<Transaction>> {
        self.store.list_transactions(query).await
    }

    /// Net credit a user has spent since `since`, reversals deducted.
    pub async fn usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Decimal> {
        self.store.sum_usage(user_id, since).await
    }

    /// Compare a pool's stored balance with the sum of its transactions.
    ///
    /// Pools open at zero and only move through ledger rows, so any opening
    /// balance must be written as a purchase (see `record_purchase`). A balance
    /// set directly on the record shows up as drift.
    pub async fn reconcile(&self, pool: &PoolRef) -> Result<Reconciliation> {
        let (query, stored_balance) = match pool {
            PoolRef::Organization { organization_id } => {
                let org = self
                    .store
                    .get_organization(organization_id)
                    .await?
                    .ok_or_else(|| crate::LedgerError::not_found("organization", organization_id))?;
                (
                    TransactionQuery::new().organization(organization_id),
                    org.unallocated(),
                )
            }
            PoolRef::MemberAllocation {
                organization_id,
                member_id,
            } => {
                let member = self
                    .store
                    .get_member(member_id)
                    .await?
                    .filter(|m| &m.organization_id == organization_id)
                    .ok_or_else(|| crate::LedgerError::not_found("member", member_id))?;
                (
                    TransactionQuery::new().member(member_id),
                    member.credit_allocated - member.credit_used,
                )
            }
            PoolRef::Personal { user_id } => {
                let profile = self
                    .store
                    .get_profile(user_id)
                    .await?
                    .ok_or_else(|| crate::LedgerError::not_found("profile", user_id))?;
                (
                    TransactionQuery::new().user(user_id),
                    profile.credits_balance,
                )
            }
        };

        let transactions = self.store.list_transactions(&query).await?;
        let ledger_balance = pool_delta(pool, &transactions);
        let result = Reconciliation {
            pool: pool.clone(),
            stored_balance,
            ledger_balance,
        };

        if !result.is_balanced() {
            tracing::warn!(
                target: "creditgate::ledger",
                pool = %pool,
                stored = %result.stored_balance,
                ledger = %result.ledger_balance,
                "pool does not reconcile with its transactions"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_new_fills_pool_identity() {
        let tx = Transaction::new(
            TransactionType::Usage,
            &PoolRef::member("org", "m1"),
            Decimal::new(-3, 2),
            "usage",
            now(),
        )
        .with_user("u1");

        assert_eq!(tx.organization_id.as_deref(), Some("org"));
        assert_eq!(tx.member_id.as_deref(), Some("m1"));
        assert_eq!(tx.user_id.as_deref(), Some("u1"));
        assert_eq!(tx.pool_ref(), Some(PoolRef::member("org", "m1")));
    }

    #[test]
    fn test_org_pool_delta_subtracts_allocations() {
        let org = PoolRef::organization("org");
        let txs = vec![
            Transaction::new(TransactionType::Purchase, &org, Decimal::new(1000, 2), "buy", now()),
            Transaction::new(
                TransactionType::CreditAllocated,
                &PoolRef::member("org", "m1"),
                Decimal::new(300, 2),
                "alloc",
                now(),
            ),
            Transaction::new(
                TransactionType::Transfer,
                &PoolRef::personal("child"),
                Decimal::new(100, 2),
                "transfer",
                now(),
            )
            .with_organization("org"),
            Transaction::new(TransactionType::Usage, &org, Decimal::new(-50, 2), "use", now()),
        ];

        assert_eq!(pool_delta(&org, &txs), Decimal::new(550, 2));
        assert_eq!(
            pool_delta(&PoolRef::member("org", "m1"), &txs),
            Decimal::new(300, 2)
        );
        assert_eq!(
            pool_delta(&PoolRef::personal("child"), &txs),
            Decimal::new(100, 2)
        );
        assert_eq!(pool_delta(&PoolRef::organization("other"), &txs), Decimal::ZERO);
    }

    #[test]
    fn test_query_matches() {
        let t0 = now();
        let tx = Transaction::new(
            TransactionType::Usage,
            &PoolRef::personal("u1"),
            Decimal::new(-1, 0),
            "x",
            t0,
        );

        assert!(TransactionQuery::new().matches(&tx));
        assert!(TransactionQuery::new().user("u1").tx_type(TransactionType::Usage).matches(&tx));
        assert!(!TransactionQuery::new().user("u2").matches(&tx));
        assert!(!TransactionQuery::new().organization("org").matches(&tx));
        assert!(TransactionQuery::new().since(t0).matches(&tx));
        assert!(!TransactionQuery::new().until(t0).matches(&tx));
    }

    #[test]
    fn test_pool_ref_serde() {
        let json = serde_json::to_value(PoolRef::member("o", "m")).unwrap();
        assert_eq!(json["kind"], "member_allocation");
        assert_eq!(json["member_id"], "m");
    }
}
