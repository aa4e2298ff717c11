//! Initial schema: domains, delegations, certificates and their SAN edges

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Domains::Table)
                    .if_not_exists()
                    .col(pk_auto(Domains::Id))
                    .col(string_len_uniq(Domains::Fqdn, 255))
                    .col(string_len(Domains::Owner, 255).default(""))
                    .col(boolean(Domains::Approved).default(false))
                    .col(
                        timestamp_with_time_zone(Domains::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Domains::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_domains_owner")
                    .table(Domains::Table)
                    .col(Domains::Owner)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Delegations::Table)
                    .if_not_exists()
                    .col(pk_auto(Delegations::Id))
                    .col(string_len(Delegations::User, 255))
                    .col(integer(Delegations::DomainId))
                    .col(
                        timestamp_with_time_zone(Delegations::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_delegations_domain")
                            .from(Delegations::Table, Delegations::DomainId)
                            .to(Domains::Table, Domains::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One delegation per user and domain
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_delegations_domain_user")
                    .table(Delegations::Table)
                    .col(Delegations::DomainId)
                    .col(Delegations::User)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Certificates::Table)
                    .if_not_exists()
                    .col(pk_auto(Certificates::Id))
                    .col(big_integer_null(Certificates::SslId))
                    .col(string_len_null(Certificates::Serial, 128).unique_key())
                    .col(string_len(Certificates::CommonName, 255))
                    .col(string_len(Certificates::Status, 16).default("Init"))
                    .col(string_len(Certificates::CertificateType, 8).default("ssl"))
                    .col(timestamp_with_time_zone_null(Certificates::NotBefore))
                    .col(timestamp_with_time_zone_null(Certificates::NotAfter))
                    .col(string_len(Certificates::IssuedBy, 255).default(""))
                    .col(string_len(Certificates::Source, 32).default(""))
                    .col(timestamp_with_time_zone_null(Certificates::Created))
                    .col(text_null(Certificates::Csr))
                    .col(
                        timestamp_with_time_zone(Certificates::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Certificates::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_common_name")
                    .table(Certificates::Table)
                    .col(Certificates::CommonName)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_ssl_id")
                    .table(Certificates::Table)
                    .col(Certificates::SslId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CertificateDomains::Table)
                    .if_not_exists()
                    .col(integer(CertificateDomains::CertificateId))
                    .col(integer(CertificateDomains::DomainId))
                    .primary_key(
                        Index::create()
                            .col(CertificateDomains::CertificateId)
                            .col(CertificateDomains::DomainId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_certificate_domains_certificate")
                            .from(CertificateDomains::Table, CertificateDomains::CertificateId)
                            .to(Certificates::Table, Certificates::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_certificate_domains_domain")
                            .from(CertificateDomains::Table, CertificateDomains::DomainId)
                            .to(Domains::Table, Domains::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CertificateDomains::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Certificates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Delegations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Domains::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Domains {
    Table,
    Id,
    Fqdn,
    Owner,
    Approved,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Delegations {
    Table,
    Id,
    User,
    DomainId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Certificates {
    Table,
    Id,
    SslId,
    Serial,
    CommonName,
    Status,
    CertificateType,
    NotBefore,
    NotAfter,
    IssuedBy,
    Source,
    Created,
    Csr,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum CertificateDomains {
    Table,
    CertificateId,
    DomainId,
}
