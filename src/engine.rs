//! The credit engine.
//!
//! [`CreditEngine`] wires the components into the request flow:
//!
//! 1. [`CreditEngine::authorize_usage`] runs the Precondition Gate and the
//!    Credit Resolver and returns which pool will pay. Nothing is written.
//! 2. The caller performs the provider call.
//! 3. [`CreditEngine::settle_usage`] prices the actual token counts and
//!    debits the resolved pool.
//!
//! An authorization that is never settled leaves no trace in the ledger.
//! Administrative operations check the actor's role before touching
//! balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::allocator::{AllocationOutcome, Allocator, BulkAllocationOutcome, FamilyTransferOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::debiter::{DebitOutcome, ReversalOutcome, UsageDebiter};
use crate::error::{LedgerError, Result};
use crate::gate::PreconditionGate;
use crate::guard::{Capability, require};
use crate::ledger::{PoolRef, Reconciliation, Transaction, TransactionLogger, TransactionQuery};
use crate::notify::{NoOpNotifier, Notification, Notifier, dispatch};
use crate::pricing::{PricingConfig, UsageCost};
use crate::purchases::PurchaseRecorder;
use crate::resolver::{OrgSide, ResolutionInput, resolve_pool};
use crate::storage::{LedgerStore, PurchaseOutcome};
use crate::types::{CreditPreference, Member, MemberRole, Organization, ParentalControls};

/// A request to use a model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRequest {
    pub user_id: String,
    /// Organization context of the request. Without it the user's first
    /// active membership is used.
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Permission to make a provider call, charged to `pool`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAuthorization {
    pub user_id: String,
    pub organization_id: Option<String>,
    pub member_id: Option<String>,
    pub pool: PoolRef,
    pub available_amount: Decimal,
    pub authorized_at: DateTime<Utc>,
}

/// Completed usage to charge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub user_id: String,
    pub pool: PoolRef,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub cost: UsageCost,
    /// `None` when the request cost nothing.
    pub transaction: Option<Transaction>,
    pub remaining: Decimal,
}

/// Entry point for all ledger operations.
#[derive(Clone)]
pub struct CreditEngine<S> {
    store: S,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    pricing: Arc<PricingConfig>,
    gate: PreconditionGate<S>,
    allocator: Allocator<S>,
    debiter: UsageDebiter<S>,
    purchases: PurchaseRecorder<S>,
    logger: TransactionLogger<S>,
}

impl<S: LedgerStore + Clone> CreditEngine<S> {
    pub fn new(store: S, config: &LedgerConfig) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            notifier: Arc::new(NoOpNotifier),
            pricing: Arc::new(config.pricing.clone()),
            gate: PreconditionGate::new(store.clone(), config.gate.clone()),
            allocator: Allocator::new(store.clone(), config.family.clone()),
            debiter: UsageDebiter::new(store.clone()),
            purchases: PurchaseRecorder::new(store.clone(), config.family.welcome_credit),
            logger: TransactionLogger::new(store.clone()),
            store,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn logger(&self) -> &TransactionLogger<S> {
        &self.logger
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    // Usage

    /// Gate and resolve a request. Writes nothing.
    #[instrument(skip(self), fields(user_id = %request.user_id))]
    pub async fn authorize_usage(&self, request: &UsageRequest) -> Result<UsageAuthorization> {
        let now = self.clock.now();
        let profile = self
            .store
            .get_profile(&request.user_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("profile", &request.user_id))?;

        let membership = self
            .active_membership(&request.user_id, request.organization_id.as_deref())
            .await?;

        // A child's family controls apply whichever organization the request
        // names.
        let supervision = self.supervising_family(&request.user_id).await?;
        if let Some((org, member)) = &supervision {
            self.gate
                .evaluate(org, member, request.model.as_deref(), now)
                .await?;
        }
        if let Some((org, member)) = &membership {
            if supervision.as_ref().is_none_or(|(_, m)| m.id != member.id) {
                self.gate
                    .evaluate(org, member, request.model.as_deref(), now)
                    .await?;
            }
        }

        let input = ResolutionInput {
            user_id: request.user_id.clone(),
            preference: profile.credit_preference,
            organization: membership
                .as_ref()
                .map(|(org, member)| OrgSide::for_member(member, org)),
            personal_balance: profile.credits_balance,
        };
        let resolution = resolve_pool(&input)?;

        debug!(
            pool = %resolution.pool,
            available = %resolution.available_amount,
            preference = %profile.credit_preference,
            "usage authorized"
        );

        Ok(UsageAuthorization {
            user_id: request.user_id.clone(),
            organization_id: membership.as_ref().map(|(org, _)| org.id.clone()),
            member_id: membership.as_ref().map(|(_, member)| member.id.clone()),
            pool: resolution.pool,
            available_amount: resolution.available_amount,
            authorized_at: now,
        })
    }

    /// Price completed usage and charge it to the authorized pool.
    ///
    /// Children in a family organization go through the gate again at
    /// settlement time, so a settlement sent without a fresh authorization
    /// cannot exceed the daily allowance.
    #[instrument(skip(self), fields(user_id = %request.user_id, pool = %request.pool))]
    pub async fn settle_usage(&self, request: &SettlementRequest) -> Result<Settlement> {
        self.check_pool_owner(&request.user_id, &request.pool).await?;
        if let Some((org, member)) = self.supervising_family(&request.user_id).await? {
            self.gate
                .evaluate(&org, &member, Some(&request.model), self.clock.now())
                .await?;
        }
        let cost = self
            .pricing
            .cost(&request.model, request.tokens_in, request.tokens_out)?;

        if cost.cost.is_zero() {
            debug!(model = %request.model, "usage priced at zero, nothing to debit");
            let remaining = self.pool_remaining(&request.pool).await?;
            return Ok(Settlement {
                cost,
                transaction: None,
                remaining,
            });
        }

        let DebitOutcome {
            transaction,
            remaining,
        } = self
            .debiter
            .debit(
                &request.pool,
                cost.cost,
                &request.user_id,
                &cost.description(),
                self.clock.now(),
            )
            .await?;

        Ok(Settlement {
            cost,
            transaction: Some(transaction),
            remaining,
        })
    }

    /// Debit an already-priced amount from a pool.
    pub async fn debit(&self, pool: &PoolRef, amount: Decimal, user_id: &str) -> Result<DebitOutcome> {
        self.debiter
            .debit(pool, amount, user_id, "Usage", self.clock.now())
            .await
    }

    /// Return a usage debit, for example after a failed provider call.
    ///
    /// Trusted callers only; [`CreditEngine::reverse_usage`] is the
    /// role-checked variant.
    pub async fn refund_usage(&self, transaction_id: &str, reason: &str) -> Result<ReversalOutcome> {
        self.debiter
            .reverse(transaction_id, reason, self.clock.now())
            .await
    }

    /// Reverse a usage transaction of an organization on behalf of `actor`.
    #[instrument(skip(self))]
    pub async fn reverse_usage(
        &self,
        actor_user_id: &str,
        transaction_id: &str,
        reason: &str,
    ) -> Result<ReversalOutcome> {
        let tx = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("transaction", transaction_id))?;
        let organization_id = tx.organization_id.as_deref().ok_or_else(|| {
            LedgerError::insufficient_permission(Capability::ReverseTransaction.as_str())
        })?;
        require(
            &self.store,
            organization_id,
            actor_user_id,
            Capability::ReverseTransaction,
        )
        .await?;

        self.debiter
            .reverse(transaction_id, reason, self.clock.now())
            .await
    }

    // Allocation

    pub async fn allocate(
        &self,
        actor_user_id: &str,
        organization_id: &str,
        member_id: &str,
        amount: Decimal,
    ) -> Result<AllocationOutcome> {
        require(
            &self.store,
            organization_id,
            actor_user_id,
            Capability::AllocateCredit,
        )
        .await?;
        self.allocator
            .allocate(organization_id, member_id, amount, self.clock.now())
            .await
    }

    pub async fn bulk_allocate(
        &self,
        actor_user_id: &str,
        organization_id: &str,
        class_id: &str,
        amount_per_student: Decimal,
    ) -> Result<BulkAllocationOutcome> {
        require(
            &self.store,
            organization_id,
            actor_user_id,
            Capability::AllocateCredit,
        )
        .await?;
        self.allocator
            .bulk_allocate(organization_id, class_id, amount_per_student, self.clock.now())
            .await
    }

    /// Family transfer, with the acting parent as sync target.
    pub async fn transfer(
        &self,
        actor_user_id: &str,
        organization_id: &str,
        child_user_id: &str,
        amount: Decimal,
    ) -> Result<FamilyTransferOutcome> {
        require(
            &self.store,
            organization_id,
            actor_user_id,
            Capability::TransferCredit,
        )
        .await?;
        self.allocator
            .transfer(
                organization_id,
                child_user_id,
                amount,
                Some(actor_user_id),
                self.clock.now(),
            )
            .await
    }

    // Purchases

    pub async fn record_purchase(
        &self,
        target: &PoolRef,
        amount: Decimal,
        external_payment_id: &str,
    ) -> Result<PurchaseOutcome> {
        self.purchases
            .record_purchase(target, amount, external_payment_id, self.clock.now())
            .await
    }

    pub async fn grant_welcome_credit(&self, organization_id: &str) -> Result<Option<PurchaseOutcome>> {
        self.purchases
            .grant_welcome_credit(organization_id, self.clock.now())
            .await
    }

    // Family

    pub async fn set_parental_controls(
        &self,
        actor_user_id: &str,
        controls: &ParentalControls,
    ) -> Result<()> {
        require(
            &self.store,
            &controls.organization_id,
            actor_user_id,
            Capability::ManageParentalControls,
        )
        .await?;
        let child = self
            .store
            .get_member(&controls.member_id)
            .await?
            .filter(|m| m.organization_id == controls.organization_id)
            .ok_or_else(|| LedgerError::not_found("member", &controls.member_id))?;
        if child.role != MemberRole::Student {
            return Err(LedgerError::invalid_request(
                "parental controls apply to children only",
            ));
        }

        self.store.save_parental_controls(controls).await?;
        info!(
            org_id = %controls.organization_id,
            member_id = %controls.member_id,
            mode = %controls.supervision_mode,
            "parental controls updated"
        );
        Ok(())
    }

    /// A child asks the family's guardians for more credit.
    ///
    /// Returns how many guardians will be notified.
    #[instrument(skip(self, message))]
    pub async fn request_credit(
        &self,
        child_user_id: &str,
        organization_id: &str,
        amount: Option<Decimal>,
        message: Option<String>,
    ) -> Result<usize> {
        let child = self
            .store
            .find_membership(organization_id, child_user_id)
            .await?
            .filter(Member::is_active)
            .ok_or(LedgerError::NotMember)?;
        if child.role != MemberRole::Student {
            return Err(LedgerError::invalid_request(
                "only children can request credit",
            ));
        }

        let recipients = self.guardians(organization_id).await?;
        let count = recipients.len();
        dispatch(
            self.notifier.clone(),
            Notification::CreditRequested {
                organization_id: organization_id.to_string(),
                child_user_id: child_user_id.to_string(),
                amount,
                message,
            },
            recipients,
        );
        Ok(count)
    }

    /// Tell guardians that moderation flagged a child's content.
    pub async fn flag_content(
        &self,
        organization_id: &str,
        child_user_id: &str,
        category: &str,
    ) -> Result<usize> {
        let recipients = self.guardians(organization_id).await?;
        let count = recipients.len();
        dispatch(
            self.notifier.clone(),
            Notification::ContentFlagged {
                organization_id: organization_id.to_string(),
                child_user_id: child_user_id.to_string(),
                category: category.to_string(),
            },
            recipients,
        );
        Ok(count)
    }

    // Profiles and ledger reads

    pub async fn set_credit_preference(
        &self,
        user_id: &str,
        preference: CreditPreference,
    ) -> Result<()> {
        self.store.set_credit_preference(user_id, preference).await
    }

    /// An organization's transactions, for actors allowed to view the ledger.
    pub async fn transactions(
        &self,
        actor_user_id: &str,
        organization_id: &str,
        query: TransactionQuery,
    ) -> Result<Vec<Transaction>> {
        require(
            &self.store,
            organization_id,
            actor_user_id,
            Capability::ViewLedger,
        )
        .await?;
        let query = TransactionQuery {
            organization_id: Some(organization_id.to_string()),
            ..query
        };
        self.logger.list(&query).await
    }

    pub async fn reconcile(&self, pool: &PoolRef) -> Result<Reconciliation> {
        self.logger.reconcile(pool).await
    }

    // Helpers

    /// The organization and active membership the request runs under.
    ///
    /// An explicitly requested organization that is not active, or that the
    /// user has no active membership in, is an error. When picking a
    /// default, inactive organizations are skipped.
    async fn active_membership(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
    ) -> Result<Option<(Organization, Member)>> {
        let candidates = match organization_id {
            Some(org_id) => self
                .store
                .find_membership(org_id, user_id)
                .await?
                .into_iter()
                .collect(),
            None => self.store.list_memberships_for_user(user_id).await?,
        };

        for member in candidates.into_iter().filter(Member::is_active) {
            let Some(org) = self.store.get_organization(&member.organization_id).await? else {
                continue;
            };
            if org.is_active() {
                return Ok(Some((org, member)));
            }
            if organization_id.is_some() {
                return Err(LedgerError::inactive(&org.id));
            }
        }

        if organization_id.is_some() {
            return Err(LedgerError::NotMember);
        }
        Ok(None)
    }

    /// The family organization supervising `user_id` as a child, if any.
    ///
    /// Returned regardless of the family's status so its trial and controls
    /// keep applying.
    async fn supervising_family(&self, user_id: &str) -> Result<Option<(Organization, Member)>> {
        let memberships = self.store.list_memberships_for_user(user_id).await?;
        for member in memberships
            .into_iter()
            .filter(|m| m.is_active() && m.role == MemberRole::Student)
        {
            let Some(org) = self.store.get_organization(&member.organization_id).await? else {
                continue;
            };
            if org.is_family() {
                return Ok(Some((org, member)));
            }
        }
        Ok(None)
    }

    /// Reject settlements against pools the user cannot spend from.
    async fn check_pool_owner(&self, user_id: &str, pool: &PoolRef) -> Result<()> {
        let owns = match pool {
            PoolRef::Personal { user_id: owner } => owner == user_id,
            PoolRef::MemberAllocation {
                organization_id,
                member_id,
            } => self
                .store
                .get_member(member_id)
                .await?
                .is_some_and(|m| {
                    &m.organization_id == organization_id && m.user_id == user_id && m.is_active()
                }),
            PoolRef::Organization { organization_id } => self
                .store
                .find_membership(organization_id, user_id)
                .await?
                .is_some_and(|m| m.is_active() && m.role.is_manager()),
        };

        if !owns {
            return Err(LedgerError::invalid_request(format!(
                "pool {} does not belong to user {}",
                pool, user_id
            )));
        }
        Ok(())
    }

    async fn pool_remaining(&self, pool: &PoolRef) -> Result<Decimal> {
        match pool {
            PoolRef::Organization { organization_id } => self
                .store
                .get_organization(organization_id)
                .await?
                .map(|o| o.unallocated())
                .ok_or_else(|| LedgerError::not_found("organization", organization_id)),
            PoolRef::MemberAllocation { member_id, .. } => self
                .store
                .get_member(member_id)
                .await?
                .map(|m| m.remaining())
                .ok_or_else(|| LedgerError::not_found("member", member_id)),
            PoolRef::Personal { user_id } => self
                .store
                .get_profile(user_id)
                .await?
                .map(|p| p.credits_balance)
                .ok_or_else(|| LedgerError::not_found("profile", user_id)),
        }
    }

    /// Active owners and admins of an organization.
    async fn guardians(&self, organization_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_members(organization_id)
            .await?
            .into_iter()
            .filter(|m| m.is_active() && m.role.is_manager())
            .map(|m| m.user_id)
            .collect())
    }
}
