//! Ledger storage.
//!
//! [`LedgerStore`] is the only component that mutates balances. Each
//! ledger-affecting method applies a balance change and appends its
//! transaction rows as one atomic unit: either both are visible afterwards
//! or neither is. Balance checks are evaluated against the stored value at
//! write time ("decrement only if the remainder covers the amount"), never
//! against a value the caller fetched earlier.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryLedgerStore`]: a single lock around all state, for tests and
//!   single-process deployments.
//! - `SeaOrmLedgerStore` (feature `database`): conditional `UPDATE`s inside
//!   a database transaction.

mod memory;
#[cfg(feature = "database")]
pub mod migration;
#[cfg(feature = "database")]
mod sea_orm_store;

pub use memory::InMemoryLedgerStore;
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{LedgerError, Result};
use crate::ledger::{PoolRef, Transaction, TransactionQuery, TransactionType};
use crate::types::{
    CreditPreference, Member, MemberStatus, Organization, OrganizationStatus, ParentalControls,
    Profile, SubscriptionState,
};

/// Outcome of [`LedgerStore::apply_purchase`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseOutcome {
    /// The purchase row, either new or the one recorded earlier for the same
    /// external id.
    pub transaction: Transaction,
    /// False when the external id had already been recorded.
    pub applied: bool,
    /// Balance of the credited pool after the call.
    pub new_balance: Decimal,
}

/// Outcome of [`LedgerStore::apply_family_transfer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub organization: Organization,
    pub child_balance: Decimal,
    /// Parent's personal balance after the display sync, if it ran.
    pub parent_balance: Option<Decimal>,
}

/// Persistence for organizations, memberships, profiles, parental controls
/// and the transaction log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Organizations

    async fn create_organization(&self, org: &Organization) -> Result<()>;

    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>>;

    async fn set_organization_status(
        &self,
        organization_id: &str,
        status: OrganizationStatus,
    ) -> Result<()>;

    async fn set_subscription(
        &self,
        organization_id: &str,
        subscription: &SubscriptionState,
    ) -> Result<()>;

    // Memberships

    async fn add_member(&self, member: &Member) -> Result<()>;

    async fn get_member(&self, member_id: &str) -> Result<Option<Member>>;

    /// The membership of `user_id` in `organization_id`, any status.
    async fn find_membership(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<Member>>;

    async fn list_memberships_for_user(&self, user_id: &str) -> Result<Vec<Member>>;

    async fn list_members(&self, organization_id: &str) -> Result<Vec<Member>>;

    /// Members of a class, any role and status.
    async fn list_class_members(&self, organization_id: &str, class_id: &str)
    -> Result<Vec<Member>>;

    async fn set_member_status(&self, member_id: &str, status: MemberStatus) -> Result<()>;

    // Profiles

    /// Insert or replace a profile.
    ///
    /// Meant for onboarding. Balance changes after that go through the
    /// transactional methods below so they stay explained by the log.
    async fn save_profile(&self, profile: &Profile) -> Result<()>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn set_credit_preference(
        &self,
        user_id: &str,
        preference: CreditPreference,
    ) -> Result<()>;

    // Parental controls

    async fn save_parental_controls(&self, controls: &ParentalControls) -> Result<()>;

    async fn get_parental_controls(
        &self,
        organization_id: &str,
        member_id: &str,
    ) -> Result<Option<ParentalControls>>;

    // Transaction log (read side)

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<Transaction>>;

    async fn find_transaction_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Transaction>>;

    /// The reversal row pointing at `transaction_id`, if any.
    async fn find_reversal_of(&self, transaction_id: &str) -> Result<Option<Transaction>>;

    /// Matching transactions ordered by creation time.
    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>>;

    /// Net credit spent by `user_id` since `since`: usage minus reversals.
    async fn sum_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<Decimal>;

    // Atomic ledger mutations

    /// Charge a usage transaction to its pool.
    ///
    /// `tx.amount` is negative. Fails with `InsufficientCredit` when the
    /// pool's remainder at write time does not cover it. Returns the pool's
    /// remainder after the debit.
    async fn apply_debit(&self, tx: &Transaction) -> Result<Decimal>;

    /// Apply `credit_allocated` transactions for one organization.
    ///
    /// All members are funded or none. Fails with `InsufficientOrgPool` when
    /// the unallocated pool cannot cover the sum. Returns the organization
    /// after the update.
    async fn apply_allocations(
        &self,
        organization_id: &str,
        transactions: &[Transaction],
    ) -> Result<Organization>;

    /// Apply a family `transfer` transaction into a child's personal balance.
    ///
    /// When `sync_parent` names a user, that user's personal balance is set
    /// to the organization's new unallocated total in the same unit. The
    /// sync writes no transaction.
    async fn apply_family_transfer(
        &self,
        tx: &Transaction,
        sync_parent: Option<&str>,
    ) -> Result<TransferOutcome>;

    /// Credit a purchase, deduplicated by `tx.external_id`.
    async fn apply_purchase(&self, tx: &Transaction) -> Result<PurchaseOutcome>;

    /// Credit a reversal back to the pool of the usage row it references.
    ///
    /// Fails with `AlreadyReversed` if a reversal for that row exists.
    /// Returns the pool's balance after the credit.
    async fn apply_reversal(&self, tx: &Transaction) -> Result<Decimal>;
}

/// Pool referenced by a transaction, or an inconsistency error.
pub(crate) fn pool_of(tx: &Transaction) -> Result<PoolRef> {
    tx.pool_ref().ok_or_else(|| {
        LedgerError::inconsistency(format!(
            "transaction {} does not identify its {} pool",
            tx.id, tx.pool
        ))
    })
}

/// Reject rows whose type or sign does not fit the mutation they are sent to.
pub(crate) fn expect_row(tx: &Transaction, tx_type: TransactionType, positive: bool) -> Result<()> {
    let sign_ok = if positive {
        tx.amount > Decimal::ZERO
    } else {
        tx.amount < Decimal::ZERO
    };
    if tx.tx_type != tx_type || !sign_ok {
        return Err(LedgerError::inconsistency(format!(
            "transaction {} is a {} of {} where a {} was expected",
            tx.id, tx.tx_type, tx.amount, tx_type
        )));
    }
    Ok(())
}
