//! Allocator.
//!
//! Moves credit from an organization's unallocated pool to its members:
//! one member at a time, a whole class at once, or (in family
//! organizations) straight into a child's personal balance.
//!
//! The member-side and organization-side counters always move together in
//! one store operation. A batch is funded completely or not at all.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::amount::validate_positive;
use crate::error::{LedgerError, Result};
use crate::ledger::{PoolRef, Transaction, TransactionLogger, TransactionType};
use crate::storage::LedgerStore;
use crate::types::{Member, MemberRole, Organization};

/// Family transfer settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// After a transfer, set the acting parent's personal balance to the
    /// family pool's unallocated total. The parent's balance then mirrors
    /// the family pool instead of being a separate wallet.
    #[serde(default = "default_sync_parent")]
    pub sync_parent_balance: bool,
    /// Credit granted once to each new family organization.
    #[serde(default)]
    pub welcome_credit: Option<Decimal>,
}

impl Default for FamilyConfig {
    fn default() -> Self {
        Self {
            sync_parent_balance: default_sync_parent(),
            welcome_credit: None,
        }
    }
}

fn default_sync_parent() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllocationOutcome {
    pub member_id: String,
    pub new_allocation: Decimal,
    pub organization_unallocated: Decimal,
}

/// A class member who was not funded by a bulk allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub member_id: String,
    pub user_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkAllocationOutcome {
    /// Member ids that received the allocation.
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
    pub total_allocated: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FamilyTransferOutcome {
    pub transaction: Transaction,
    pub child_balance: Decimal,
    pub organization_unallocated: Decimal,
    /// Set when the parent balance sync ran.
    pub parent_balance: Option<Decimal>,
}

#[derive(Clone)]
pub struct Allocator<S> {
    store: S,
    logger: TransactionLogger<S>,
    family: FamilyConfig,
}

impl<S: LedgerStore + Clone> Allocator<S> {
    pub fn new(store: S, family: FamilyConfig) -> Self {
        Self {
            logger: TransactionLogger::new(store.clone()),
            store,
            family,
        }
    }

    async fn active_organization(&self, organization_id: &str) -> Result<Organization> {
        let org = self
            .store
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("organization", organization_id))?;
        if !org.is_active() {
            return Err(LedgerError::inactive(organization_id));
        }
        Ok(org)
    }

    /// Allocate `amount` of the organization pool to one member.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        organization_id: &str,
        member_id: &str,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<AllocationOutcome> {
        let amount = validate_positive(amount)?;
        self.active_organization(organization_id).await?;

        let member = self
            .store
            .get_member(member_id)
            .await?
            .filter(|m| m.organization_id == organization_id)
            .ok_or_else(|| LedgerError::not_found("member", member_id))?;
        if !member.is_active() {
            return Err(LedgerError::invalid_request(format!(
                "member {} is archived",
                member_id
            )));
        }

        let tx = allocation_row(organization_id, &member, amount, now);
        let org = self
            .store
            .apply_allocations(organization_id, std::slice::from_ref(&tx))
            .await?;
        self.logger.record(std::slice::from_ref(&tx));

        let new_allocation = self
            .store
            .get_member(member_id)
            .await?
            .map(|m| m.credit_allocated)
            .unwrap_or(member.credit_allocated + amount);

        info!(
            org_id = %organization_id,
            member_id = %member_id,
            amount = %amount,
            new_allocation = %new_allocation,
            "credit allocated"
        );

        Ok(AllocationOutcome {
            member_id: member_id.to_string(),
            new_allocation,
            organization_unallocated: org.unallocated(),
        })
    }

    /// Allocate `amount_per_student` to every active student in a class.
    ///
    /// Archived students are reported in `failed`. If the pool cannot fund
    /// every eligible student the call fails with `InsufficientOrgPool` and
    /// nobody is funded.
    #[instrument(skip(self))]
    pub async fn bulk_allocate(
        &self,
        organization_id: &str,
        class_id: &str,
        amount_per_student: Decimal,
        now: DateTime<Utc>,
    ) -> Result<BulkAllocationOutcome> {
        let amount = validate_positive(amount_per_student)?;
        let org = self.active_organization(organization_id).await?;

        let students: Vec<Member> = self
            .store
            .list_class_members(organization_id, class_id)
            .await?
            .into_iter()
            .filter(|m| m.role == MemberRole::Student)
            .collect();

        let (eligible, archived): (Vec<Member>, Vec<Member>) =
            students.into_iter().partition(Member::is_active);
        let failed: Vec<BulkFailure> = archived
            .into_iter()
            .map(|m| BulkFailure {
                member_id: m.id,
                user_id: m.user_id,
                reason: "member is archived".to_string(),
            })
            .collect();

        if eligible.is_empty() {
            debug!(class_id = %class_id, "no eligible students in class");
            return Ok(BulkAllocationOutcome {
                failed,
                ..Default::default()
            });
        }

        let total = amount * Decimal::from(eligible.len());
        if org.unallocated() < total {
            return Err(LedgerError::InsufficientOrgPool {
                available: org.unallocated(),
                requested: total,
            });
        }

        let rows: Vec<Transaction> = eligible
            .iter()
            .map(|m| allocation_row(organization_id, m, amount, now))
            .collect();
        self.store.apply_allocations(organization_id, &rows).await?;
        self.logger.record(&rows);

        info!(
            org_id = %organization_id,
            class_id = %class_id,
            students = eligible.len(),
            skipped = failed.len(),
            total = %total,
            "class allocation completed"
        );

        Ok(BulkAllocationOutcome {
            succeeded: eligible.into_iter().map(|m| m.id).collect(),
            failed,
            total_allocated: total,
        })
    }

    /// Move family credit into a child's personal balance.
    ///
    /// `parent_user_id` is the acting parent. With
    /// [`FamilyConfig::sync_parent_balance`] their personal balance is reset
    /// to the family pool's unallocated total afterwards.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        organization_id: &str,
        child_user_id: &str,
        amount: Decimal,
        parent_user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FamilyTransferOutcome> {
        let amount = validate_positive(amount)?;
        let org = self.active_organization(organization_id).await?;
        if !org.is_family() {
            return Err(LedgerError::invalid_request(
                "transfers are only available in family organizations",
            ));
        }

        let child = self
            .store
            .find_membership(organization_id, child_user_id)
            .await?
            .filter(Member::is_active)
            .ok_or_else(|| LedgerError::not_found("member", child_user_id))?;
        if child.role != MemberRole::Student {
            return Err(LedgerError::invalid_request(format!(
                "user {} is not a child in this family",
                child_user_id
            )));
        }

        let mut tx = Transaction::new(
            TransactionType::Transfer,
            &PoolRef::personal(child_user_id),
            amount,
            "Family credit transfer",
            now,
        )
        .with_organization(organization_id);
        tx.member_id = Some(child.id.clone());

        let sync_parent = parent_user_id.filter(|_| self.family.sync_parent_balance);
        let outcome = self.store.apply_family_transfer(&tx, sync_parent).await?;
        self.logger.record(std::slice::from_ref(&tx));

        info!(
            org_id = %organization_id,
            child = %child_user_id,
            amount = %amount,
            child_balance = %outcome.child_balance,
            parent_synced = outcome.parent_balance.is_some(),
            "family credit transferred"
        );

        Ok(FamilyTransferOutcome {
            transaction: tx,
            child_balance: outcome.child_balance,
            organization_unallocated: outcome.organization.unallocated(),
            parent_balance: outcome.parent_balance,
        })
    }
}

fn allocation_row(
    organization_id: &str,
    member: &Member,
    amount: Decimal,
    now: DateTime<Utc>,
) -> Transaction {
    Transaction::new(
        TransactionType::CreditAllocated,
        &PoolRef::member(organization_id, &member.id),
        amount,
        "Credit allocation",
        now,
    )
    .with_user(&member.user_id)
}
