//! In-memory ledger store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{LedgerStore, PurchaseOutcome, TransferOutcome, expect_row, pool_of};
use crate::amount::non_negative;
use crate::error::{LedgerError, Result};
use crate::ledger::{PoolKind, PoolRef, Transaction, TransactionQuery, TransactionType};
use crate::types::{
    CreditPreference, Member, MemberStatus, Organization, OrganizationStatus, ParentalControls,
    Profile, SubscriptionState,
};

/// In-memory store.
///
/// All state sits behind one lock, so every mutation is serialized and
/// atomic. Wraps data in Arc for cheap cloning.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    inner: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    organizations: HashMap<String, Organization>,
    members: HashMap<String, Member>,
    profiles: HashMap<String, Profile>,
    controls: HashMap<(String, String), ParentalControls>,
    transactions: Vec<Transaction>,
}

impl State {
    fn organization_mut(&mut self, organization_id: &str) -> Result<&mut Organization> {
        self.organizations
            .get_mut(organization_id)
            .ok_or_else(|| LedgerError::not_found("organization", organization_id))
    }

    fn profile_mut(&mut self, user_id: &str) -> Result<&mut Profile> {
        self.profiles
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::not_found("profile", user_id))
    }

    fn member_in(&self, organization_id: &str, member_id: &str) -> Result<&Member> {
        self.members
            .get(member_id)
            .filter(|m| m.organization_id == organization_id)
            .ok_or_else(|| LedgerError::not_found("member", member_id))
    }

    /// Spendable remainder of a pool.
    fn pool_balance(&self, pool: &PoolRef) -> Result<Decimal> {
        match pool {
            PoolRef::Organization { organization_id } => self
                .organizations
                .get(organization_id)
                .map(Organization::unallocated)
                .ok_or_else(|| LedgerError::not_found("organization", organization_id)),
            PoolRef::MemberAllocation {
                organization_id,
                member_id,
            } => Ok(self.member_in(organization_id, member_id)?.remaining()),
            PoolRef::Personal { user_id } => self
                .profiles
                .get(user_id)
                .map(|p| p.credits_balance)
                .ok_or_else(|| LedgerError::not_found("profile", user_id)),
        }
    }
}

impl InMemoryLedgerStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transaction recorded so far, oldest first.
    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.read()
            .map(|state| state.transactions.clone())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.inner
            .read()
            .map_err(|_| LedgerError::storage("ledger state lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.inner
            .write()
            .map_err(|_| LedgerError::storage("ledger state lock poisoned"))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        let mut state = self.write()?;
        if state.organizations.contains_key(&org.id) {
            return Err(LedgerError::invalid_request(format!(
                "organization {} already exists",
                org.id
            )));
        }
        state.organizations.insert(org.id.clone(), org.clone());
        Ok(())
    }

    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>> {
        Ok(self.read()?.organizations.get(organization_id).cloned())
    }

    async fn set_organization_status(
        &self,
        organization_id: &str,
        status: OrganizationStatus,
    ) -> Result<()> {
        self.write()?.organization_mut(organization_id)?.status = status;
        Ok(())
    }

    async fn set_subscription(
        &self,
        organization_id: &str,
        subscription: &SubscriptionState,
    ) -> Result<()> {
        self.write()?.organization_mut(organization_id)?.subscription = subscription.clone();
        Ok(())
    }

    async fn add_member(&self, member: &Member) -> Result<()> {
        let mut state = self.write()?;
        if !state.organizations.contains_key(&member.organization_id) {
            return Err(LedgerError::not_found("organization", &member.organization_id));
        }
        let duplicate = state.members.values().any(|m| {
            m.id == member.id
                || (m.organization_id == member.organization_id && m.user_id == member.user_id)
        });
        if duplicate {
            return Err(LedgerError::invalid_request(format!(
                "user {} is already a member of {}",
                member.user_id, member.organization_id
            )));
        }
        state.members.insert(member.id.clone(), member.clone());
        Ok(())
    }

    async fn get_member(&self, member_id: &str) -> Result<Option<Member>> {
        Ok(self.read()?.members.get(member_id).cloned())
    }

    async fn find_membership(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<Member>> {
        Ok(self
            .read()?
            .members
            .values()
            .find(|m| m.organization_id == organization_id && m.user_id == user_id)
            .cloned())
    }

    async fn list_memberships_for_user(&self, user_id: &str) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = self
            .read()?
            .members
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn list_members(&self, organization_id: &str) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = self
            .read()?
            .members
            .values()
            .filter(|m| m.organization_id == organization_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn list_class_members(
        &self,
        organization_id: &str,
        class_id: &str,
    ) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = self
            .read()?
            .members
            .values()
            .filter(|m| {
                m.organization_id == organization_id && m.class_id.as_deref() == Some(class_id)
            })
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn set_member_status(&self, member_id: &str, status: MemberStatus) -> Result<()> {
        let mut state = self.write()?;
        let member = state
            .members
            .get_mut(member_id)
            .ok_or_else(|| LedgerError::not_found("member", member_id))?;
        member.status = status;
        Ok(())
    }

    async fn save_profile(&self, profile: &Profile) -> Result<()> {
        self.write()?
            .profiles
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self.read()?.profiles.get(user_id).cloned())
    }

    async fn set_credit_preference(
        &self,
        user_id: &str,
        preference: CreditPreference,
    ) -> Result<()> {
        self.write()?.profile_mut(user_id)?.credit_preference = preference;
        Ok(())
    }

    async fn save_parental_controls(&self, controls: &ParentalControls) -> Result<()> {
        let mut state = self.write()?;
        state.member_in(&controls.organization_id, &controls.member_id)?;
        state.controls.insert(
            (controls.organization_id.clone(), controls.member_id.clone()),
            controls.clone(),
        );
        Ok(())
    }

    async fn get_parental_controls(
        &self,
        organization_id: &str,
        member_id: &str,
    ) -> Result<Option<ParentalControls>> {
        Ok(self
            .read()?
            .controls
            .get(&(organization_id.to_string(), member_id.to_string()))
            .cloned())
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .find(|tx| tx.id == transaction_id)
            .cloned())
    }

    async fn find_transaction_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .find(|tx| tx.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_reversal_of(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .find(|tx| tx.reverses.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>> {
        let state = self.read()?;
        let mut matched: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|tx| query.matches(tx))
            .cloned()
            .collect();
        matched.sort_by_key(|tx| tx.created_at);
        if let Some(limit) = query.limit {
            matched.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(matched)
    }

    async fn sum_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<Decimal> {
        let spent: Decimal = self
            .read()?
            .transactions
            .iter()
            .filter(|tx| {
                tx.user_id.as_deref() == Some(user_id)
                    && tx.created_at >= since
                    && matches!(tx.tx_type, TransactionType::Usage | TransactionType::Reversal)
            })
            .map(|tx| -tx.amount)
            .sum();
        Ok(non_negative(spent))
    }

    async fn apply_debit(&self, tx: &Transaction) -> Result<Decimal> {
        expect_row(tx, TransactionType::Usage, false)?;
        let pool = pool_of(tx)?;
        let requested = -tx.amount;

        let mut state = self.write()?;
        let available = state.pool_balance(&pool)?;
        if available < requested {
            return Err(LedgerError::InsufficientCredit {
                pool: pool.kind(),
                available: non_negative(available),
                requested,
            });
        }

        match &pool {
            PoolRef::Organization { organization_id } => {
                state.organization_mut(organization_id)?.credit_balance -= requested;
            }
            PoolRef::MemberAllocation { member_id, .. } => {
                let member = state
                    .members
                    .get_mut(member_id)
                    .ok_or_else(|| LedgerError::not_found("member", member_id))?;
                member.credit_used += requested;
            }
            PoolRef::Personal { user_id } => {
                state.profile_mut(user_id)?.credits_balance -= requested;
            }
        }

        state.transactions.push(tx.clone());
        state.pool_balance(&pool)
    }

    async fn apply_allocations(
        &self,
        organization_id: &str,
        transactions: &[Transaction],
    ) -> Result<Organization> {
        let mut total = Decimal::ZERO;
        let mut targets = Vec::with_capacity(transactions.len());
        for tx in transactions {
            expect_row(tx, TransactionType::CreditAllocated, true)?;
            match pool_of(tx)? {
                PoolRef::MemberAllocation {
                    organization_id: org,
                    member_id,
                } if org == organization_id => {
                    total += tx.amount;
                    targets.push((member_id, tx.amount));
                }
                other => {
                    return Err(LedgerError::inconsistency(format!(
                        "allocation {} targets {} outside organization {}",
                        tx.id, other, organization_id
                    )));
                }
            }
        }

        let mut state = self.write()?;
        let org = state
            .organizations
            .get(organization_id)
            .ok_or_else(|| LedgerError::not_found("organization", organization_id))?;
        if !org.is_active() {
            return Err(LedgerError::inactive(organization_id));
        }
        if org.unallocated() < total {
            return Err(LedgerError::InsufficientOrgPool {
                available: org.unallocated(),
                requested: total,
            });
        }
        for (member_id, _) in &targets {
            if !state.member_in(organization_id, member_id)?.is_active() {
                return Err(LedgerError::invalid_request(format!(
                    "member {} is archived",
                    member_id
                )));
            }
        }

        for (member_id, amount) in &targets {
            if let Some(member) = state.members.get_mut(member_id) {
                member.credit_allocated += *amount;
            }
        }
        let org = state.organization_mut(organization_id)?;
        org.credit_allocated += total;
        let updated = org.clone();
        state.transactions.extend(transactions.iter().cloned());
        Ok(updated)
    }

    async fn apply_family_transfer(
        &self,
        tx: &Transaction,
        sync_parent: Option<&str>,
    ) -> Result<TransferOutcome> {
        expect_row(tx, TransactionType::Transfer, true)?;
        let PoolRef::Personal { user_id: child_id } = pool_of(tx)? else {
            return Err(LedgerError::inconsistency(format!(
                "transfer {} must credit a personal pool",
                tx.id
            )));
        };
        let organization_id = tx.organization_id.clone().ok_or_else(|| {
            LedgerError::inconsistency(format!("transfer {} has no organization", tx.id))
        })?;

        let mut state = self.write()?;
        let org = state
            .organizations
            .get(&organization_id)
            .ok_or_else(|| LedgerError::not_found("organization", &organization_id))?;
        if !org.is_active() {
            return Err(LedgerError::inactive(&organization_id));
        }
        if org.unallocated() < tx.amount {
            return Err(LedgerError::InsufficientOrgPool {
                available: org.unallocated(),
                requested: tx.amount,
            });
        }
        if !state.profiles.contains_key(&child_id) {
            return Err(LedgerError::not_found("profile", &child_id));
        }
        if let Some(parent) = sync_parent.filter(|p| !state.profiles.contains_key(*p)) {
            return Err(LedgerError::not_found("profile", parent));
        }

        let org = state.organization_mut(&organization_id)?;
        org.credit_allocated += tx.amount;
        let organization = org.clone();

        let child = state.profile_mut(&child_id)?;
        child.credits_balance += tx.amount;
        let child_balance = child.credits_balance;

        let parent_balance = match sync_parent {
            Some(parent) => {
                let parent = state.profile_mut(parent)?;
                parent.credits_balance = organization.unallocated();
                Some(parent.credits_balance)
            }
            None => None,
        };

        state.transactions.push(tx.clone());
        Ok(TransferOutcome {
            organization,
            child_balance,
            parent_balance,
        })
    }

    async fn apply_purchase(&self, tx: &Transaction) -> Result<PurchaseOutcome> {
        expect_row(tx, TransactionType::Purchase, true)?;
        let pool = pool_of(tx)?;

        let mut state = self.write()?;
        let existing = tx.external_id.as_deref().and_then(|external_id| {
            state
                .transactions
                .iter()
                .find(|t| t.external_id.as_deref() == Some(external_id))
                .cloned()
        });
        if let Some(existing) = existing {
            let new_balance = state.pool_balance(&pool)?;
            return Ok(PurchaseOutcome {
                transaction: existing,
                applied: false,
                new_balance,
            });
        }

        match &pool {
            PoolRef::Organization { organization_id } => {
                state.organization_mut(organization_id)?.credit_balance += tx.amount;
            }
            PoolRef::Personal { user_id } => {
                state.profile_mut(user_id)?.credits_balance += tx.amount;
            }
            PoolRef::MemberAllocation { .. } => {
                return Err(LedgerError::invalid_request(
                    "purchases credit an organization or a personal balance",
                ));
            }
        }

        state.transactions.push(tx.clone());
        Ok(PurchaseOutcome {
            transaction: tx.clone(),
            applied: true,
            new_balance: state.pool_balance(&pool)?,
        })
    }

    async fn apply_reversal(&self, tx: &Transaction) -> Result<Decimal> {
        expect_row(tx, TransactionType::Reversal, true)?;
        let pool = pool_of(tx)?;
        let original_id = tx
            .reverses
            .as_deref()
            .ok_or_else(|| LedgerError::invalid_request("reversal does not reference a transaction"))?;

        let mut state = self.write()?;
        let original = state
            .transactions
            .iter()
            .find(|t| t.id == original_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("transaction", original_id))?;
        if original.tx_type != TransactionType::Usage {
            return Err(LedgerError::invalid_request(format!(
                "only usage can be reversed, {} is a {}",
                original.id, original.tx_type
            )));
        }
        if state
            .transactions
            .iter()
            .any(|t| t.reverses.as_deref() == Some(original_id))
        {
            return Err(LedgerError::AlreadyReversed {
                transaction_id: original_id.to_string(),
            });
        }
        if original.pool_ref().as_ref() != Some(&pool) || original.amount != -tx.amount {
            return Err(LedgerError::inconsistency(format!(
                "reversal {} does not mirror usage {}",
                tx.id, original.id
            )));
        }

        match &pool {
            PoolRef::Organization { organization_id } => {
                state.organization_mut(organization_id)?.credit_balance += tx.amount;
            }
            PoolRef::MemberAllocation { member_id, .. } => {
                let member = state
                    .members
                    .get_mut(member_id)
                    .ok_or_else(|| LedgerError::not_found("member", member_id))?;
                if member.credit_used < tx.amount {
                    return Err(LedgerError::inconsistency(format!(
                        "member {} has used {} but reversal returns {}",
                        member_id, member.credit_used, tx.amount
                    )));
                }
                member.credit_used -= tx.amount;
            }
            PoolRef::Personal { user_id } => {
                state.profile_mut(user_id)?.credits_balance += tx.amount;
            }
        }

        state.transactions.push(tx.clone());
        state.pool_balance(&pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberRole, OrganizationType};

    fn d(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    async fn seeded() -> (InMemoryLedgerStore, Organization, Member) {
        let store = InMemoryLedgerStore::new();
        let org = Organization::new("School", OrganizationType::School).with_balance(d(1000));
        store.create_organization(&org).await.unwrap();
        let member = Member::new(&org.id, "student-1", MemberRole::Student);
        store.add_member(&member).await.unwrap();
        (store, org, member)
    }

    fn allocation(org: &Organization, member: &Member, amount: Decimal) -> Transaction {
        Transaction::new(
            TransactionType::CreditAllocated,
            &PoolRef::member(&org.id, &member.id),
            amount,
            "allocation",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_allocation_updates_both_sides() {
        let (store, org, member) = seeded().await;

        let updated = store
            .apply_allocations(&org.id, &[allocation(&org, &member, d(300))])
            .await
            .unwrap();

        assert_eq!(updated.credit_allocated, d(300));
        assert_eq!(updated.unallocated(), d(700));
        let member = store.get_member(&member.id).await.unwrap().unwrap();
        assert_eq!(member.credit_allocated, d(300));
        assert_eq!(store.all_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_allocation_beyond_pool_writes_nothing() {
        let (store, org, member) = seeded().await;

        let err = store
            .apply_allocations(&org.id, &[allocation(&org, &member, d(1001))])
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientOrgPool { .. }));
        assert!(store.all_transactions().is_empty());
        let org = store.get_organization(&org.id).await.unwrap().unwrap();
        assert_eq!(org.credit_allocated, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_debit_refuses_overdraft() {
        let (store, org, member) = seeded().await;
        store
            .apply_allocations(&org.id, &[allocation(&org, &member, d(5))])
            .await
            .unwrap();

        let usage = |cents| {
            Transaction::new(
                TransactionType::Usage,
                &PoolRef::member(&org.id, &member.id),
                -d(cents),
                "usage",
                Utc::now(),
            )
        };

        assert_eq!(store.apply_debit(&usage(3)).await.unwrap(), d(2));
        let err = store.apply_debit(&usage(3)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCredit {
                pool: PoolKind::MemberAllocation,
                available: d(2),
                requested: d(3),
            }
        );
    }

    #[tokio::test]
    async fn test_purchase_dedup_by_external_id() {
        let (store, org, _) = seeded().await;
        let purchase = Transaction::new(
            TransactionType::Purchase,
            &PoolRef::organization(&org.id),
            d(500),
            "top-up",
            Utc::now(),
        )
        .with_external_id("pi_123");

        let first = store.apply_purchase(&purchase).await.unwrap();
        assert!(first.applied);
        assert_eq!(first.new_balance, d(1500));

        let mut replay = purchase.clone();
        replay.id = "another-id".into();
        let second = store.apply_purchase(&replay).await.unwrap();
        assert!(!second.applied);
        assert_eq!(second.transaction.id, purchase.id);
        assert_eq!(second.new_balance, d(1500));
    }

    #[tokio::test]
    async fn test_sum_usage_nets_reversals() {
        let store = InMemoryLedgerStore::new();
        store
            .save_profile(&Profile::new("kid").with_balance(d(100)))
            .await
            .unwrap();
        let start = Utc::now();
        let usage = Transaction::new(
            TransactionType::Usage,
            &PoolRef::personal("kid"),
            -d(30),
            "usage",
            Utc::now(),
        );
        store.apply_debit(&usage).await.unwrap();
        assert_eq!(store.sum_usage("kid", start).await.unwrap(), d(30));

        let reversal = Transaction::new(
            TransactionType::Reversal,
            &PoolRef::personal("kid"),
            d(30),
            "refund",
            Utc::now(),
        )
        .with_reverses(&usage.id);
        assert_eq!(store.apply_reversal(&reversal).await.unwrap(), d(100));
        assert_eq!(store.sum_usage("kid", start).await.unwrap(), Decimal::ZERO);

        let again = Transaction::new(
            TransactionType::Reversal,
            &PoolRef::personal("kid"),
            d(30),
            "refund",
            Utc::now(),
        )
        .with_reverses(&usage.id);
        assert!(matches!(
            store.apply_reversal(&again).await,
            Err(LedgerError::AlreadyReversed { .. })
        ));
    }
}
