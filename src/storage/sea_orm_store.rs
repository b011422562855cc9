//! SeaORM-backed ledger storage.
//!
//! Every ledger mutation opens a database transaction, applies a
//! conditional `UPDATE` whose `WHERE` clause carries the balance check, and
//! inserts the transaction rows before committing. When the conditional
//! update touches no row the transaction is rolled back and the row is read
//! again to tell a missing record from a short balance.
//!
//! # Example
//!
//! ```rust,ignore
//! use creditgate::storage::{SeaOrmLedgerStore, migration::Migrator};
//! use sea_orm_migration::MigratorTrait;
//!
//! let db = sea_orm::Database::connect(&database_url).await?;
//! Migrator::up(&db, None).await?;
//! let store = SeaOrmLedgerStore::new(db);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use std::str::FromStr;

use super::{LedgerStore, PurchaseOutcome, TransferOutcome, expect_row, pool_of};
use crate::amount::{from_micros, non_negative, to_micros};
use crate::error::{LedgerError, Result};
use crate::ledger::{PoolKind, PoolRef, Transaction, TransactionQuery, TransactionType};
use crate::types::{
    CreditPreference, Member, MemberStatus, Organization, OrganizationStatus, ParentalControls,
    Profile, SubscriptionState,
};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    pub mod organization {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "organizations")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub name: String,
            pub org_type: String,
            pub credit_balance: i64,
            pub credit_allocated: i64,
            pub status: String,
            pub subscription_status: String,
            pub trial_ends_at: Option<i64>,
            pub created_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod member {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "organization_members")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub organization_id: String,
            pub user_id: String,
            pub role: String,
            pub credit_allocated: i64,
            pub credit_used: i64,
            pub class_id: Option<String>,
            pub status: String,
            /// JSON array of model names.
            pub allowed_models: Option<String>,
            pub joined_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod profile {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "profiles")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub user_id: String,
            pub display_name: Option<String>,
            pub credits_balance: i64,
            pub credit_preference: String,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod parental_controls {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "parental_controls")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub organization_id: String,
            #[sea_orm(primary_key, auto_increment = false)]
            pub member_id: String,
            pub supervision_mode: String,
            pub daily_credit_limit: Option<i64>,
            pub daily_time_limit_minutes: Option<i32>,
            pub quiet_hours_start: Option<String>,
            pub quiet_hours_end: Option<String>,
            pub cumulative_credits: bool,
            pub utc_offset_minutes: i32,
            pub allowance_anchor: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod credit_transaction {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "credit_transactions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub organization_id: Option<String>,
            pub member_id: Option<String>,
            pub user_id: Option<String>,
            pub tx_type: String,
            pub pool: String,
            pub amount: i64,
            pub description: String,
            #[sea_orm(unique)]
            pub external_id: Option<String>,
            #[sea_orm(unique)]
            pub reverses: Option<String>,
            pub created_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{credit_transaction, member, organization, parental_controls, profile};

// =============================================================================
// Store
// =============================================================================

/// SeaORM-backed ledger store.
#[derive(Clone)]
pub struct SeaOrmLedgerStore {
    db: DatabaseConnection,
}

impl SeaOrmLedgerStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Access the underlying connection.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn begin(&self) -> Result<DatabaseTransaction> {
        self.db.begin().await.map_err(LedgerError::storage)
    }
}

async fn commit(txn: DatabaseTransaction) -> Result<()> {
    txn.commit().await.map_err(LedgerError::storage)
}

/// Roll back and hand `err` back to the caller.
async fn abort<T>(txn: DatabaseTransaction, err: LedgerError) -> Result<T> {
    txn.rollback().await.map_err(LedgerError::storage)?;
    Err(err)
}

// =============================================================================
// Conversion helpers
// =============================================================================

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(value: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| LedgerError::storage(format!("timestamp out of range: {}", value)))
}

fn parse<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(value).map_err(LedgerError::storage)
}

fn time_to_string(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(LedgerError::storage)
}

fn organization_from_model(model: organization::Model) -> Result<Organization> {
    Ok(Organization {
        id: model.id,
        name: model.name,
        org_type: parse(&model.org_type)?,
        credit_balance: from_micros(model.credit_balance),
        credit_allocated: from_micros(model.credit_allocated),
        status: parse(&model.status)?,
        subscription: SubscriptionState {
            status: parse(&model.subscription_status)?,
            trial_ends_at: model.trial_ends_at.map(from_millis).transpose()?,
        },
        created_at: from_millis(model.created_at)?,
    })
}

fn member_from_model(model: member::Model) -> Result<Member> {
    let allowed_models = model
        .allowed_models
        .as_deref()
        .map(serde_json::from_str::<Vec<String>>)
        .transpose()
        .map_err(LedgerError::storage)?;

    Ok(Member {
        id: model.id,
        organization_id: model.organization_id,
        user_id: model.user_id,
        role: parse(&model.role)?,
        credit_allocated: from_micros(model.credit_allocated),
        credit_used: from_micros(model.credit_used),
        class_id: model.class_id,
        status: parse(&model.status)?,
        allowed_models,
        joined_at: from_millis(model.joined_at)?,
    })
}

fn profile_from_model(model: profile::Model) -> Result<Profile> {
    Ok(Profile {
        user_id: model.user_id,
        display_name: model.display_name,
        credits_balance: from_micros(model.credits_balance),
        credit_preference: parse(&model.credit_preference)?,
    })
}

fn controls_from_model(model: parental_controls::Model) -> Result<ParentalControls> {
    Ok(ParentalControls {
        organization_id: model.organization_id,
        member_id: model.member_id,
        supervision_mode: parse(&model.supervision_mode)?,
        daily_credit_limit: model.daily_credit_limit.map(from_micros),
        daily_time_limit_minutes: model
            .daily_time_limit_minutes
            .map(|m| u32::try_from(m).unwrap_or(0)),
        quiet_hours_start: model.quiet_hours_start.as_deref().map(parse_time).transpose()?,
        quiet_hours_end: model.quiet_hours_end.as_deref().map(parse_time).transpose()?,
        cumulative_credits: model.cumulative_credits,
        utc_offset_minutes: model.utc_offset_minutes,
        allowance_anchor: from_millis(model.allowance_anchor)?,
    })
}

fn transaction_from_model(model: credit_transaction::Model) -> Result<Transaction> {
    Ok(Transaction {
        id: model.id,
        organization_id: model.organization_id,
        member_id: model.member_id,
        user_id: model.user_id,
        tx_type: parse(&model.tx_type)?,
        pool: parse(&model.pool)?,
        amount: from_micros(model.amount),
        description: model.description,
        external_id: model.external_id,
        reverses: model.reverses,
        created_at: from_millis(model.created_at)?,
    })
}

fn transaction_to_active_model(tx: &Transaction) -> Result<credit_transaction::ActiveModel> {
    Ok(credit_transaction::ActiveModel {
        id: Set(tx.id.clone()),
        organization_id: Set(tx.organization_id.clone()),
        member_id: Set(tx.member_id.clone()),
        user_id: Set(tx.user_id.clone()),
        tx_type: Set(tx.tx_type.as_str().to_string()),
        pool: Set(tx.pool.as_str().to_string()),
        amount: Set(to_micros(tx.amount)?),
        description: Set(tx.description.clone()),
        external_id: Set(tx.external_id.clone()),
        reverses: Set(tx.reverses.clone()),
        created_at: Set(millis(tx.created_at)),
    })
}

async fn insert_transaction<C: ConnectionTrait>(conn: &C, tx: &Transaction) -> Result<()> {
    credit_transaction::Entity::insert(transaction_to_active_model(tx)?)
        .exec_without_returning(conn)
        .await
        .map_err(LedgerError::storage)?;
    Ok(())
}

// =============================================================================
// Pool helpers (run inside a database transaction)
// =============================================================================

async fn load_organization<C: ConnectionTrait>(
    conn: &C,
    organization_id: &str,
) -> Result<Option<Organization>> {
    organization::Entity::find_by_id(organization_id)
        .one(conn)
        .await
        .map_err(LedgerError::storage)?
        .map(organization_from_model)
        .transpose()
}

async fn load_member<C: ConnectionTrait>(conn: &C, member_id: &str) -> Result<Option<Member>> {
    member::Entity::find_by_id(member_id)
        .one(conn)
        .await
        .map_err(LedgerError::storage)?
        .map(member_from_model)
        .transpose()
}

async fn load_profile<C: ConnectionTrait>(conn: &C, user_id: &str) -> Result<Option<Profile>> {
    profile::Entity::find_by_id(user_id)
        .one(conn)
        .await
        .map_err(LedgerError::storage)?
        .map(profile_from_model)
        .transpose()
}

/// Spendable remainder of a pool.
async fn pool_balance<C: ConnectionTrait>(conn: &C, pool: &PoolRef) -> Result<Decimal> {
    match pool {
        PoolRef::Organization { organization_id } => load_organization(conn, organization_id)
            .await?
            .map(|o| o.unallocated())
            .ok_or_else(|| LedgerError::not_found("organization", organization_id)),
        PoolRef::MemberAllocation {
            organization_id,
            member_id,
        } => load_member(conn, member_id)
            .await?
            .filter(|m| &m.organization_id == organization_id)
            .map(|m| m.remaining())
            .ok_or_else(|| LedgerError::not_found("member", member_id)),
        PoolRef::Personal { user_id } => load_profile(conn, user_id)
            .await?
            .map(|p| p.credits_balance)
            .ok_or_else(|| LedgerError::not_found("profile", user_id)),
    }
}

/// Add `micros` to a pool's balance. Returns the number of rows touched.
async fn credit_pool<C: ConnectionTrait>(conn: &C, pool: &PoolRef, micros: i64) -> Result<u64> {
    let result = match pool {
        PoolRef::Organization { organization_id } => organization::Entity::update_many()
            .col_expr(
                organization::Column::CreditBalance,
                Expr::col(organization::Column::CreditBalance).add(micros),
            )
            .filter(organization::Column::Id.eq(organization_id.as_str()))
            .exec(conn)
            .await,
        PoolRef::MemberAllocation {
            organization_id,
            member_id,
        } => member::Entity::update_many()
            .col_expr(
                member::Column::CreditUsed,
                Expr::col(member::Column::CreditUsed).sub(micros),
            )
            .filter(member::Column::Id.eq(member_id.as_str()))
            .filter(member::Column::OrganizationId.eq(organization_id.as_str()))
            .filter(member::Column::CreditUsed.gte(micros))
            .exec(conn)
            .await,
        PoolRef::Personal { user_id } => profile::Entity::update_many()
            .col_expr(
                profile::Column::CreditsBalance,
                Expr::col(profile::Column::CreditsBalance).add(micros),
            )
            .filter(profile::Column::UserId.eq(user_id.as_str()))
            .exec(conn)
            .await,
    };
    Ok(result.map_err(LedgerError::storage)?.rows_affected)
}

/// Take `micros` out of a pool if its remainder covers it.
async fn debit_pool<C: ConnectionTrait>(conn: &C, pool: &PoolRef, micros: i64) -> Result<u64> {
    let result = match pool {
        PoolRef::Organization { organization_id } => organization::Entity::update_many()
            .col_expr(
                organization::Column::CreditBalance,
                Expr::col(organization::Column::CreditBalance).sub(micros),
            )
            .filter(organization::Column::Id.eq(organization_id.as_str()))
            .filter(
                Expr::col(organization::Column::CreditBalance)
                    .gte(Expr::col(organization::Column::CreditAllocated).add(micros)),
            )
            .exec(conn)
            .await,
        PoolRef::MemberAllocation {
            organization_id,
            member_id,
        } => member::Entity::update_many()
            .col_expr(
                member::Column::CreditUsed,
                Expr::col(member::Column::CreditUsed).add(micros),
            )
            .filter(member::Column::Id.eq(member_id.as_str()))
            .filter(member::Column::OrganizationId.eq(organization_id.as_str()))
            .filter(
                Expr::col(member::Column::CreditAllocated)
                    .gte(Expr::col(member::Column::CreditUsed).add(micros)),
            )
            .exec(conn)
            .await,
        PoolRef::Personal { user_id } => profile::Entity::update_many()
            .col_expr(
                profile::Column::CreditsBalance,
                Expr::col(profile::Column::CreditsBalance).sub(micros),
            )
            .filter(profile::Column::UserId.eq(user_id.as_str()))
            .filter(profile::Column::CreditsBalance.gte(micros))
            .exec(conn)
            .await,
    };
    Ok(result.map_err(LedgerError::storage)?.rows_affected)
}

/// Move `micros` from an active organization's unallocated pool into its
/// allocated total, if the pool covers it.
async fn reserve_org_credit<C: ConnectionTrait>(
    conn: &C,
    organization_id: &str,
    micros: i64,
) -> Result<u64> {
    let result = organization::Entity::update_many()
        .col_expr(
            organization::Column::CreditAllocated,
            Expr::col(organization::Column::CreditAllocated).add(micros),
        )
        .filter(organization::Column::Id.eq(organization_id))
        .filter(organization::Column::Status.eq(OrganizationStatus::Active.as_str()))
        .filter(
            Expr::col(organization::Column::CreditBalance)
                .gte(Expr::col(organization::Column::CreditAllocated).add(micros)),
        )
        .exec(conn)
        .await
        .map_err(LedgerError::storage)?;
    Ok(result.rows_affected)
}

/// Explain why [`reserve_org_credit`] touched nothing.
async fn reserve_failure<C: ConnectionTrait>(
    conn: &C,
    organization_id: &str,
    requested: Decimal,
) -> Result<LedgerError> {
    Ok(match load_organization(conn, organization_id).await? {
        None => LedgerError::not_found("organization", organization_id),
        Some(org) if !org.is_active() => LedgerError::inactive(organization_id),
        Some(org) => LedgerError::InsufficientOrgPool {
            available: org.unallocated(),
            requested,
        },
    })
}

#[async_trait]
impl LedgerStore for SeaOrmLedgerStore {
    async fn create_organization(&self, org: &Organization) -> Result<()> {
        if load_organization(&self.db, &org.id).await?.is_some() {
            return Err(LedgerError::invalid_request(format!(
                "organization {} already exists",
                org.id
            )));
        }

        organization::ActiveModel {
            id: Set(org.id.clone()),
            name: Set(org.name.clone()),
            org_type: Set(org.org_type.as_str().to_string()),
            credit_balance: Set(to_micros(org.credit_balance)?),
            credit_allocated: Set(to_micros(org.credit_allocated)?),
            status: Set(org.status.as_str().to_string()),
            subscription_status: Set(org.subscription.status.as_str().to_string()),
            trial_ends_at: Set(org.subscription.trial_ends_at.map(millis)),
            created_at: Set(millis(org.created_at)),
        }
        .insert(&self.db)
        .await
        .map_err(LedgerError::storage)?;

        tracing::debug!(org_id = %org.id, org_type = %org.org_type, "organization created");
        Ok(())
    }

    async fn get_organization(&self, organization_id: &str) -> Result<Option<Organization>> {
        load_organization(&self.db, organization_id).await
    }

    async fn set_organization_status(
        &self,
        organization_id: &str,
        status: OrganizationStatus,
    ) -> Result<()> {
        let result = organization::Entity::update_many()
            .col_expr(organization::Column::Status, Expr::value(status.as_str()))
            .filter(organization::Column::Id.eq(organization_id))
            .exec(&self.db)
            .await
            .map_err(LedgerError::storage)?;
        if result.rows_affected == 0 {
            return Err(LedgerError::not_found("organization", organization_id));
        }
        Ok(())
    }

    async fn set_subscription(
        &self,
        organization_id: &str,
        subscription: &SubscriptionState,
    ) -> Result<()> {
        let result = organization::Entity::update_many()
            .col_expr(
                organization::Column::SubscriptionStatus,
                Expr::value(subscription.status.as_str()),
            )
            .col_expr(
                organization::Column::TrialEndsAt,
                Expr::value(subscription.trial_ends_at.map(millis)),
            )
            .filter(organization::Column::Id.eq(organization_id))
            .exec(&self.db)
            .await
            .map_err(LedgerError::storage)?;
        if result.rows_affected == 0 {
            return Err(LedgerError::not_found("organization", organization_id));
        }
        Ok(())
    }

    async fn add_member(&self, member: &Member) -> Result<()> {
        if load_organization(&self.db, &member.organization_id)
            .await?
            .is_none()
        {
            return Err(LedgerError::not_found("organization", &member.organization_id));
        }
        if self
            .find_membership(&member.organization_id, &member.user_id)
            .await?
            .is_some()
        {
            return Err(LedgerError::invalid_request(format!(
                "user {} is already a member of {}",
                member.user_id, member.organization_id
            )));
        }

        let allowed_models = member
            .allowed_models
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(LedgerError::storage)?;

        member::ActiveModel {
            id: Set(member.id.clone()),
            organization_id: Set(member.organization_id.clone()),
            user_id: Set(member.user_id.clone()),
            role: Set(member.role.as_str().to_string()),
            credit_allocated: Set(to_micros(member.credit_allocated)?),
            credit_used: Set(to_micros(member.credit_used)?),
            class_id: Set(member.class_id.clone()),
            status: Set(member.status.as_str().to_string()),
            allowed_models: Set(allowed_models),
            joined_at: Set(millis(member.joined_at)),
        }
        .insert(&self.db)
        .await
        .map_err(LedgerError::storage)?;
        Ok(())
    }

    async fn get_member(&self, member_id: &str) -> Result<Option<Member>> {
        load_member(&self.db, member_id).await
    }

    async fn find_membership(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<Member>> {
        member::Entity::find()
            .filter(member::Column::OrganizationId.eq(organization_id))
            .filter(member::Column::UserId.eq(user_id))
            .one(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .map(member_from_model)
            .transpose()
    }

    async fn list_memberships_for_user(&self, user_id: &str) -> Result<Vec<Member>> {
        member::Entity::find()
            .filter(member::Column::UserId.eq(user_id))
            .order_by_asc(member::Column::JoinedAt)
            .all(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .into_iter()
            .map(member_from_model)
            .collect()
    }

    async fn list_members(&self, organization_id: &str) -> Result<Vec<Member>> {
        member::Entity::find()
            .filter(member::Column::OrganizationId.eq(organization_id))
            .order_by_asc(member::Column::JoinedAt)
            .all(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .into_iter()
            .map(member_from_model)
            .collect()
    }

    async fn list_class_members(
        &self,
        organization_id: &str,
        class_id: &str,
    ) -> Result<Vec<Member>> {
        member::Entity::find()
            .filter(member::Column::OrganizationId.eq(organization_id))
            .filter(member::Column::ClassId.eq(class_id))
            .order_by_asc(member::Column::JoinedAt)
            .all(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .into_iter()
            .map(member_from_model)
            .collect()
    }

    async fn set_member_status(&self, member_id: &str, status: MemberStatus) -> Result<()> {
        let result = member::Entity::update_many()
            .col_expr(member::Column::Status, Expr::value(status.as_str()))
            .filter(member::Column::Id.eq(member_id))
            .exec(&self.db)
            .await
            .map_err(LedgerError::storage)?;
        if result.rows_affected == 0 {
            return Err(LedgerError::not_found("member", member_id));
        }
        Ok(())
    }

    async fn save_profile(&self, p: &Profile) -> Result<()> {
        let model = profile::ActiveModel {
            user_id: Set(p.user_id.clone()),
            display_name: Set(p.display_name.clone()),
            credits_balance: Set(to_micros(p.credits_balance)?),
            credit_preference: Set(p.credit_preference.as_str().to_string()),
        };

        profile::Entity::insert(model)
            .on_conflict(
                OnConflict::column(profile::Column::UserId)
                    .update_columns([
                        profile::Column::DisplayName,
                        profile::Column::CreditsBalance,
                        profile::Column::CreditPreference,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(LedgerError::storage)?;
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        load_profile(&self.db, user_id).await
    }

    async fn set_credit_preference(
        &self,
        user_id: &str,
        preference: CreditPreference,
    ) -> Result<()> {
        let result = profile::Entity::update_many()
            .col_expr(
                profile::Column::CreditPreference,
                Expr::value(preference.as_str()),
            )
            .filter(profile::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await
            .map_err(LedgerError::storage)?;
        if result.rows_affected == 0 {
            return Err(LedgerError::not_found("profile", user_id));
        }
        Ok(())
    }

    async fn save_parental_controls(&self, controls: &ParentalControls) -> Result<()> {
        load_member(&self.db, &controls.member_id)
            .await?
            .filter(|m| m.organization_id == controls.organization_id)
            .ok_or_else(|| LedgerError::not_found("member", &controls.member_id))?;

        let model = parental_controls::ActiveModel {
            organization_id: Set(controls.organization_id.clone()),
            member_id: Set(controls.member_id.clone()),
            supervision_mode: Set(controls.supervision_mode.as_str().to_string()),
            daily_credit_limit: Set(controls.daily_credit_limit.map(to_micros).transpose()?),
            daily_time_limit_minutes: Set(controls
                .daily_time_limit_minutes
                .map(|m| i32::try_from(m).unwrap_or(i32::MAX))),
            quiet_hours_start: Set(controls.quiet_hours_start.map(time_to_string)),
            quiet_hours_end: Set(controls.quiet_hours_end.map(time_to_string)),
            cumulative_credits: Set(controls.cumulative_credits),
            utc_offset_minutes: Set(controls.utc_offset_minutes),
            allowance_anchor: Set(millis(controls.allowance_anchor)),
        };

        parental_controls::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    parental_controls::Column::OrganizationId,
                    parental_controls::Column::MemberId,
                ])
                .update_columns([
                    parental_controls::Column::SupervisionMode,
                    parental_controls::Column::DailyCreditLimit,
                    parental_controls::Column::DailyTimeLimitMinutes,
                    parental_controls::Column::QuietHoursStart,
                    parental_controls::Column::QuietHoursEnd,
                    parental_controls::Column::CumulativeCredits,
                    parental_controls::Column::UtcOffsetMinutes,
                    parental_controls::Column::AllowanceAnchor,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(LedgerError::storage)?;
        Ok(())
    }

    async fn get_parental_controls(
        &self,
        organization_id: &str,
        member_id: &str,
    ) -> Result<Option<ParentalControls>> {
        parental_controls::Entity::find_by_id((organization_id.to_string(), member_id.to_string()))
            .one(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .map(controls_from_model)
            .transpose()
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        credit_transaction::Entity::find_by_id(transaction_id)
            .one(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .map(transaction_from_model)
            .transpose()
    }

    async fn find_transaction_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Transaction>> {
        credit_transaction::Entity::find()
            .filter(credit_transaction::Column::ExternalId.eq(external_id))
            .one(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .map(transaction_from_model)
            .transpose()
    }

    async fn find_reversal_of(&self, transaction_id: &str) -> Result<Option<Transaction>> {
        credit_transaction::Entity::find()
            .filter(credit_transaction::Column::Reverses.eq(transaction_id))
            .one(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .map(transaction_from_model)
            .transpose()
    }

    async fn list_transactions(&self, query: &TransactionQuery) -> Result<Vec<Transaction>> {
        let mut select = credit_transaction::Entity::find();
        if let Some(org) = &query.organization_id {
            select = select.filter(credit_transaction::Column::OrganizationId.eq(org.as_str()));
        }
        if let Some(member) = &query.member_id {
            select = select.filter(credit_transaction::Column::MemberId.eq(member.as_str()));
        }
        if let Some(user) = &query.user_id {
            select = select.filter(credit_transaction::Column::UserId.eq(user.as_str()));
        }
        if let Some(tx_type) = query.tx_type {
            select = select.filter(credit_transaction::Column::TxType.eq(tx_type.as_str()));
        }
        if let Some(pool) = query.pool {
            select = select.filter(credit_transaction::Column::Pool.eq(pool.as_str()));
        }
        if let Some(since) = query.since {
            select = select.filter(credit_transaction::Column::CreatedAt.gte(millis(since)));
        }
        if let Some(until) = query.until {
            select = select.filter(credit_transaction::Column::CreatedAt.lt(millis(until)));
        }
        select = select.order_by_asc(credit_transaction::Column::CreatedAt);
        if let Some(limit) = query.limit {
            select = select.limit(limit);
        }

        select
            .all(&self.db)
            .await
            .map_err(LedgerError::storage)?
            .into_iter()
            .map(transaction_from_model)
            .collect()
    }

    async fn sum_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<Decimal> {
        let rows = credit_transaction::Entity::find()
            .filter(credit_transaction::Column::UserId.eq(user_id))
            .filter(credit_transaction::Column::CreatedAt.gte(millis(since)))
            .filter(credit_transaction::Column::TxType.is_in([
                TransactionType::Usage.as_str(),
                TransactionType::Reversal.as_str(),
            ]))
            .all(&self.db)
            .await
            .map_err(LedgerError::storage)?;

        let spent: i64 = rows.iter().map(|row| -row.amount).sum();
        Ok(non_negative(from_micros(spent)))
    }

    async fn apply_debit(&self, tx: &Transaction) -> Result<Decimal> {
        expect_row(tx, TransactionType::Usage, false)?;
        let pool = pool_of(tx)?;
        let requested = -tx.amount;
        let micros = to_micros(requested)?;

        let txn = self.begin().await?;
        if debit_pool(&txn, &pool, micros).await? == 0 {
            let err = match pool_balance(&txn, &pool).await {
                Ok(available) => LedgerError::InsufficientCredit {
                    pool: pool.kind(),
                    available: non_negative(available),
                    requested,
                },
                Err(e) => e,
            };
            return abort(txn, err).await;
        }

        insert_transaction(&txn, tx).await?;
        let remaining = pool_balance(&txn, &pool).await?;
        commit(txn).await?;

        tracing::debug!(pool = %pool, amount = %requested, remaining = %remaining, "debit applied");
        Ok(remaining)
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
                    targets.push((member_id, to_micros(tx.amount)?));
                }
                other => {
                    return Err(LedgerError::inconsistency(format!(
                        "allocation {} targets {} outside organization {}",
                        tx.id, other, organization_id
                    )));
                }
            }
        }

        let txn = self.begin().await?;
        if reserve_org_credit(&txn, organization_id, to_micros(total)?).await? == 0 {
            let err = reserve_failure(&txn, organization_id, total).await?;
            return abort(txn, err).await;
        }

        for (member_id, micros) in &targets {
            let result = member::Entity::update_many()
                .col_expr(
                    member::Column::CreditAllocated,
                    Expr::col(member::Column::CreditAllocated).add(*micros),
                )
                .filter(member::Column::Id.eq(member_id.as_str()))
                .filter(member::Column::OrganizationId.eq(organization_id))
                .filter(member::Column::Status.eq(MemberStatus::Active.as_str()))
                .exec(&txn)
                .await
                .map_err(LedgerError::storage)?;
            if result.rows_affected == 0 {
                let err = match load_member(&txn, member_id).await? {
                    Some(m) if m.organization_id == organization_id => {
                        LedgerError::invalid_request(format!("member {} is archived", member_id))
                    }
                    _ => LedgerError::not_found("member", member_id.as_str()),
                };
                return abort(txn, err).await;
            }
        }

        for tx in transactions {
            insert_transaction(&txn, tx).await?;
        }
        let organization = load_organization(&txn, organization_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("organization", organization_id))?;
        commit(txn).await?;
        Ok(organization)
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
        let micros = to_micros(tx.amount)?;

        let txn = self.begin().await?;
        if reserve_org_credit(&txn, &organization_id, micros).await? == 0 {
            let err = reserve_failure(&txn, &organization_id, tx.amount).await?;
            return abort(txn, err).await;
        }

        let child = PoolRef::personal(&child_id);
        if credit_pool(&txn, &child, micros).await? == 0 {
            return abort(txn, LedgerError::not_found("profile", &child_id)).await;
        }
        let child_balance = pool_balance(&txn, &child).await?;

        let organization = load_organization(&txn, &organization_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("organization", &organization_id))?;

        let parent_balance = match sync_parent {
            Some(parent) => {
                let synced = to_micros(organization.unallocated())?;
                let result = profile::Entity::update_many()
                    .col_expr(profile::Column::CreditsBalance, Expr::value(synced))
                    .filter(profile::Column::UserId.eq(parent))
                    .exec(&txn)
                    .await
                    .map_err(LedgerError::storage)?;
                if result.rows_affected == 0 {
                    return abort(txn, LedgerError::not_found("profile", parent)).await;
                }
                Some(organization.unallocated())
            }
            None => None,
        };

        insert_transaction(&txn, tx).await?;
        commit(txn).await?;
        Ok(TransferOutcome {
            organization,
            child_balance,
            parent_balance,
        })
    }

    async fn apply_purchase(&self, tx: &Transaction) -> Result<PurchaseOutcome> {
        expect_row(tx, TransactionType::Purchase, true)?;
        let pool = pool_of(tx)?;
        if pool.kind() == PoolKind::MemberAllocation {
            return Err(LedgerError::invalid_request(
                "purchases credit an organization or a personal balance",
            ));
        }

        if let Some(external_id) = tx.external_id.as_deref() {
            if let Some(existing) = self.find_transaction_by_external_id(external_id).await? {
                return Ok(PurchaseOutcome {
                    transaction: existing,
                    applied: false,
                    new_balance: pool_balance(&self.db, &pool).await?,
                });
            }
        }

        let txn = self.begin().await?;
        if credit_pool(&txn, &pool, to_micros(tx.amount)?).await? == 0 {
            let err = pool_balance(&txn, &pool)
                .await
                .err()
                .unwrap_or_else(|| LedgerError::storage("purchase credited no pool"));
            return abort(txn, err).await;
        }

        if let Err(err) = insert_transaction(&txn, tx).await {
            txn.rollback().await.map_err(LedgerError::storage)?;
            // Lost a race on the unique external id
            if let Some(external_id) = tx.external_id.as_deref() {
                if let Some(existing) = self.find_transaction_by_external_id(external_id).await? {
                    return Ok(PurchaseOutcome {
                        transaction: existing,
                        applied: false,
                        new_balance: pool_balance(&self.db, &pool).await?,
                    });
                }
            }
            return Err(err);
        }

        let new_balance = pool_balance(&txn, &pool).await?;
        commit(txn).await?;
        Ok(PurchaseOutcome {
            transaction: tx.clone(),
            applied: true,
            new_balance,
        })
    }

    async fn apply_reversal(&self, tx: &Transaction) -> Result<Decimal> {
        expect_row(tx, TransactionType::Reversal, true)?;
        let pool = pool_of(tx)?;
        let original_id = tx.reverses.as_deref().ok_or_else(|| {
            LedgerError::invalid_request("reversal does not reference a transaction")
        })?;

        let txn = self.begin().await?;
        let original = match credit_transaction::Entity::find_by_id(original_id)
            .one(&txn)
            .await
            .map_err(LedgerError::storage)?
        {
            Some(model) => transaction_from_model(model)?,
            None => return abort(txn, LedgerError::not_found("transaction", original_id)).await,
        };
        if original.tx_type != TransactionType::Usage {
            let err = LedgerError::invalid_request(format!(
                "only usage can be reversed, {} is a {}",
                original.id, original.tx_type
            ));
            return abort(txn, err).await;
        }
        let already = credit_transaction::Entity::find()
            .filter(credit_transaction::Column::Reverses.eq(original_id))
            .one(&txn)
            .await
            .map_err(LedgerError::storage)?;
        if already.is_some() {
            let err = LedgerError::AlreadyReversed {
                transaction_id: original_id.to_string(),
            };
            return abort(txn, err).await;
        }
        if original.pool_ref().as_ref() != Some(&pool) || original.amount != -tx.amount {
            let err = LedgerError::inconsistency(format!(
                "reversal {} does not mirror usage {}",
                tx.id, original.id
            ));
            return abort(txn, err).await;
        }

        if credit_pool(&txn, &pool, to_micros(tx.amount)?).await? == 0 {
            let err = LedgerError::inconsistency(format!(
                "reversal {} could not be credited to {}",
                tx.id, pool
            ));
            return abort(txn, err).await;
        }

        if let Err(err) = insert_transaction(&txn, tx).await {
            txn.rollback().await.map_err(LedgerError::storage)?;
            if self.find_reversal_of(original_id).await?.is_some() {
                return Err(LedgerError::AlreadyReversed {
                    transaction_id: original_id.to_string(),
                });
            }
            return Err(err);
        }

        let balance = pool_balance(&txn, &pool).await?;
        commit(txn).await?;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migration::Migrator;
    use crate::types::{MemberRole, OrganizationType};
    use sea_orm::{ConnectOptions, Database};
    use sea_orm_migration::MigratorTrait;

    fn d(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    async fn store() -> SeaOrmLedgerStore {
        // One connection, so every query sees the same in-memory database
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).min_connections(1);
        let db = Database::connect(options).await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        SeaOrmLedgerStore::new(db)
    }

    #[tokio::test]
    async fn test_round_trips_records() {
        let store = store().await;
        let org = Organization::new("Lycée", OrganizationType::School).with_balance(d(1234));
        store.create_organization(&org).await.unwrap();

        let member = Member::new(&org.id, "u1", MemberRole::Student)
            .with_class("7b")
            .with_allowed_models(["small"]);
        store.add_member(&member).await.unwrap();

        let loaded = store.get_organization(&org.id).await.unwrap().unwrap();
        assert_eq!(loaded.credit_balance, d(1234));
        assert_eq!(loaded.org_type, OrganizationType::School);

        let loaded = store.get_member(&member.id).await.unwrap().unwrap();
        assert_eq!(loaded.class_id.as_deref(), Some("7b"));
        assert_eq!(loaded.allowed_models, Some(vec!["small".to_string()]));

        let controls = ParentalControls::new(&org.id, &member.id)
            .with_daily_limit(d(50))
            .with_quiet_hours(
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            );
        store.save_parental_controls(&controls).await.unwrap();
        let loaded = store
            .get_parental_controls(&org.id, &member.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.daily_credit_limit, Some(d(50)));
        assert_eq!(loaded.quiet_hours_end, NaiveTime::from_hms_opt(7, 0, 0));
    }

    #[tokio::test]
    async fn test_conditional_debit() {
        let store = store().await;
        store
            .save_profile(&Profile::new("u1").with_balance(d(5)))
            .await
            .unwrap();
        let usage = |cents| {
            Transaction::new(
                TransactionType::Usage,
                &PoolRef::personal("u1"),
                -d(cents),
                "usage",
                Utc::now(),
            )
        };

        assert_eq!(store.apply_debit(&usage(3)).await.unwrap(), d(2));
        let err = store.apply_debit(&usage(3)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCredit { .. }));

        let rows = store
            .list_transactions(&TransactionQuery::new().user("u1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_allocation_rolls_back_on_archived_member() {
        let store = store().await;
        let org = Organization::new("School", OrganizationType::School).with_balance(d(1000));
        store.create_organization(&org).await.unwrap();
        let active = Member::new(&org.id, "a", MemberRole::Student);
        let archived = Member::new(&org.id, "b", MemberRole::Student);
        store.add_member(&active).await.unwrap();
        store.add_member(&archived).await.unwrap();
        store
            .set_member_status(&archived.id, MemberStatus::Archived)
            .await
            .unwrap();

        let txs: Vec<Transaction> = [&active, &archived]
            .iter()
            .map(|m| {
                Transaction::new(
                    TransactionType::CreditAllocated,
                    &PoolRef::member(&org.id, &m.id),
                    d(100),
                    "allocation",
                    Utc::now(),
                )
            })
            .collect();

        assert!(store.apply_allocations(&org.id, &txs).await.is_err());
        let org = store.get_organization(&org.id).await.unwrap().unwrap();
        assert_eq!(org.credit_allocated, Decimal::ZERO);
        let member = store.get_member(&active.id).await.unwrap().unwrap();
        assert_eq!(member.credit_allocated, Decimal::ZERO);
        assert!(
            store
                .list_transactions(&TransactionQuery::new())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_purchase_and_reversal_are_idempotent() {
        let store = store().await;
        store
            .save_profile(&Profile::new("u1").with_balance(Decimal::ZERO))
            .await
            .unwrap();
        let purchase = Transaction::new(
            TransactionType::Purchase,
            &PoolRef::personal("u1"),
            d(1000),
            "top-up",
            Utc::now(),
        )
        .with_external_id("pi_1");

        assert!(store.apply_purchase(&purchase).await.unwrap().applied);
        let mut replay = purchase.clone();
        replay.id = "other".into();
        let second = store.apply_purchase(&replay).await.unwrap();
        assert!(!second.applied);
        assert_eq!(second.new_balance, d(1000));

        let usage = Transaction::new(
            TransactionType::Usage,
            &PoolRef::personal("u1"),
            -d(250),
            "usage",
            Utc::now(),
        );
        store.apply_debit(&usage).await.unwrap();
        let reversal = |id: &str| {
            Transaction::new(
                TransactionType::Reversal,
                &PoolRef::personal("u1"),
                d(250),
                "refund",
                Utc::now(),
            )
            .with_reverses(id)
        };
        assert_eq!(store.apply_reversal(&reversal(&usage.id)).await.unwrap(), d(1000));
        assert!(matches!(
            store.apply_reversal(&reversal(&usage.id)).await,
            Err(LedgerError::AlreadyReversed { .. })
        ));
    }
}
