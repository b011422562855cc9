//! Schema for [`SeaOrmLedgerStore`](super::SeaOrmLedgerStore).
//!
//! Amounts are stored as signed integers of millionths of a credit and
//! timestamps as Unix milliseconds, so every supported backend compares and
//! sums them exactly.
//!
//! ```rust,ignore
//! use creditgate::storage::migration::Migrator;
//! use sea_orm_migration::MigratorTrait;
//!
//! Migrator::up(&db, None).await?;
//! ```

use sea_orm_migration::{prelude::*, schema::*};

/// Runs every ledger migration in order.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250301_000001_create_ledger_tables::Migration)]
    }
}

mod m20250301_000001_create_ledger_tables {
    use super::*;

    #[derive(DeriveMigrationName)]
    pub struct Migration;

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Organizations::Table)
                        .if_not_exists()
                        .col(string(Organizations::Id).primary_key())
                        .col(string(Organizations::Name).not_null())
                        .col(string(Organizations::OrgType).not_null())
                        .col(big_integer(Organizations::CreditBalance).not_null().default(0))
                        .col(
                            big_integer(Organizations::CreditAllocated)
                                .not_null()
                                .default(0),
                        )
                        .col(string(Organizations::Status).not_null())
                        .col(string(Organizations::SubscriptionStatus).not_null())
                        .col(big_integer_null(Organizations::TrialEndsAt))
                        .col(big_integer(Organizations::CreatedAt).not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrganizationMembers::Table)
                        .if_not_exists()
                        .col(string(OrganizationMembers::Id).primary_key())
                        .col(string(OrganizationMembers::OrganizationId).not_null())
                        .col(string(OrganizationMembers::UserId).not_null())
                        .col(string(OrganizationMembers::Role).not_null())
                        .col(
                            big_integer(OrganizationMembers::CreditAllocated)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            big_integer(OrganizationMembers::CreditUsed)
                                .not_null()
                                .default(0),
                        )
                        .col(string_null(OrganizationMembers::ClassId))
                        .col(string(OrganizationMembers::Status).not_null())
                        .col(text_null(OrganizationMembers::AllowedModels))
                        .col(big_integer(OrganizationMembers::JoinedAt).not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_organization_members_organization")
                                .from(OrganizationMembers::Table, OrganizationMembers::OrganizationId)
                                .to(Organizations::Table, Organizations::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_organization_members_org_user")
                        .table(OrganizationMembers::Table)
                        .col(OrganizationMembers::OrganizationId)
                        .col(OrganizationMembers::UserId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_organization_members_user")
                        .table(OrganizationMembers::Table)
                        .col(OrganizationMembers::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Profiles::Table)
                        .if_not_exists()
                        .col(string(Profiles::UserId).primary_key())
                        .col(string_null(Profiles::DisplayName))
                        .col(big_integer(Profiles::CreditsBalance).not_null().default(0))
                        .col(string(Profiles::CreditPreference).not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ParentalControls::Table)
                        .if_not_exists()
                        .col(string(ParentalControls::OrganizationId).not_null())
                        .col(string(ParentalControls::MemberId).not_null())
                        .col(string(ParentalControls::SupervisionMode).not_null())
                        .col(big_integer_null(ParentalControls::DailyCreditLimit))
                        .col(integer_null(ParentalControls::DailyTimeLimitMinutes))
                        .col(string_null(ParentalControls::QuietHoursStart))
                        .col(string_null(ParentalControls::QuietHoursEnd))
                        .col(
                            boolean(ParentalControls::CumulativeCredits)
                                .not_null()
                                .default(false),
                        )
                        .col(
                            integer(ParentalControls::UtcOffsetMinutes)
                                .not_null()
                                .default(0),
                        )
                        .col(big_integer(ParentalControls::AllowanceAnchor).not_null())
                        .primary_key(
                            Index::create()
                                .col(ParentalControls::OrganizationId)
                                .col(ParentalControls::MemberId),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CreditTransactions::Table)
                        .if_not_exists()
                        .col(string(CreditTransactions::Id).primary_key())
                        .col(string_null(CreditTransactions::OrganizationId))
                        .col(string_null(CreditTransactions::MemberId))
                        .col(string_null(CreditTransactions::UserId))
                        .col(string(CreditTransactions::TxType).not_null())
                        .col(string(CreditTransactions::Pool).not_null())
                        .col(big_integer(CreditTransactions::Amount).not_null())
                        .col(text(CreditTransactions::Description).not_null())
                        // Purchase idempotency key
                        .col(string_null(CreditTransactions::ExternalId).unique_key())
                        // At most one reversal per usage row
                        .col(string_null(CreditTransactions::Reverses).unique_key())
                        .col(big_integer(CreditTransactions::CreatedAt).not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_credit_transactions_org_created")
                        .table(CreditTransactions::Table)
                        .col(CreditTransactions::OrganizationId)
                        .col(CreditTransactions::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_credit_transactions_user_created")
                        .table(CreditTransactions::Table)
                        .col(CreditTransactions::UserId)
                        .col(CreditTransactions::CreatedAt)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CreditTransactions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ParentalControls::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Profiles::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(OrganizationMembers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Organizations::Table).to_owned())
                .await?;
            Ok(())
        }
    }

    #[derive(DeriveIden)]
    enum Organizations {
        Table,
        Id,
        Name,
        OrgType,
        CreditBalance,
        CreditAllocated,
        Status,
        SubscriptionStatus,
        TrialEndsAt,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum OrganizationMembers {
        Table,
        Id,
        OrganizationId,
        UserId,
        Role,
        CreditAllocated,
        CreditUsed,
        ClassId,
        Status,
        AllowedModels,
        JoinedAt,
    }

    #[derive(DeriveIden)]
    enum Profiles {
        Table,
        UserId,
        DisplayName,
        CreditsBalance,
        CreditPreference,
    }

    #[derive(DeriveIden)]
    enum ParentalControls {
        Table,
        OrganizationId,
        MemberId,
        SupervisionMode,
        DailyCreditLimit,
        DailyTimeLimitMinutes,
        QuietHoursStart,
        QuietHoursEnd,
        CumulativeCredits,
        UtcOffsetMinutes,
        AllowanceAnchor,
    }

    #[derive(DeriveIden)]
    enum CreditTransactions {
        Table,
        Id,
        OrganizationId,
        MemberId,
        UserId,
        TxType,
        Pool,
        Amount,
        Description,
        ExternalId,
        Reverses,
        CreatedAt,
    }
}
