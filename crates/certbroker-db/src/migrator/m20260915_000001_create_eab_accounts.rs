//! EAB key table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EabAccounts::Table)
                    .if_not_exists()
                    .col(string_len(EabAccounts::Id, 64).primary_key())
                    .col(string_len(EabAccounts::User, 255))
                    .col(string_len(EabAccounts::HmacKey, 128))
                    .col(string_len(EabAccounts::Comment, 255).default(""))
                    .col(string_len_null(EabAccounts::BoundAccount, 512))
                    .col(
                        timestamp_with_time_zone(EabAccounts::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_eab_accounts_user")
                    .table(EabAccounts::Table)
                    .col(EabAccounts::User)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EabAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EabAccounts {
    Table,
    Id,
    User,
    HmacKey,
    Comment,
    BoundAccount,
    CreatedAt,
}
