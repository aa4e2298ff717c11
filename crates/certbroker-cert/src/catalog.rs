//! Certificate lookups shared by the orchestrators and the API

use std::collections::HashSet;

use certbroker_db::entities::{certificate, certificate_domain, domain};
use certbroker_db::{normalize_serial, CertificateStatus, CertificateType};
use certbroker_domain::access_context;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter, QueryOrder,
};
use serde::Serialize;

use crate::error::{CertError, Result};

/// A certificate row with its SAN names
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRecord {
    #[serde(flatten)]
    pub certificate: certificate::Model,
    pub domains: Vec<String>,
}

pub async fn load_record<C: ConnectionTrait>(db: &C, certificate: certificate::Model) -> Result<CertificateRecord> {
    let mut domains: Vec<String> = certificate
        .find_related(domain::Entity)
        .all(db)
        .await?
        .into_iter()
        .map(|d| d.fqdn)
        .collect();
    domains.sort();
    Ok(CertificateRecord {
        certificate,
        domains,
    })
}

pub async fn find_by_serial<C: ConnectionTrait>(db: &C, serial: &str) -> Result<Option<certificate::Model>> {
    Ok(certificate::Entity::find()
        .filter(certificate::Column::Serial.eq(normalize_serial(serial)))
        .one(db)
        .await?)
}

/// Record for `serial`, or `NotFound`
pub async fn details<C: ConnectionTrait>(db: &C, serial: &str) -> Result<CertificateRecord> {
    let certificate = find_by_serial(db, serial)
        .await?
        .ok_or_else(|| CertError::NotFound(format!("certificate {}", serial)))?;
    load_record(db, certificate).await
}

/// SSL certificates naming at least one domain visible to `user`, newest first
pub async fn list_for_user<C: ConnectionTrait>(db: &C, user: &str) -> Result<Vec<CertificateRecord>> {
    let ctx = access_context(db, user).await?;
    if ctx.visible.is_empty() {
        return Ok(Vec::new());
    }

    let ids: HashSet<i32> = certificate_domain::Entity::find()
        .filter(certificate_domain::Column::DomainId.is_in(ctx.visible.iter().map(|d| d.id)))
        .all(db)
        .await?
        .into_iter()
        .map(|edge| edge.certificate_id)
        .collect();

    let certificates = certificate::Entity::find()
        .filter(certificate::Column::Id.is_in(ids))
        .filter(certificate::Column::CertificateType.eq(CertificateType::Ssl))
        .order_by_desc(certificate::Column::Id)
        .all(db)
        .await?;

    let mut records = Vec::with_capacity(certificates.len());
    for certificate in certificates {
        records.push(load_record(db, certificate).await?);
    }
    Ok(records)
}

/// Certificates of one kind for a common name that are still worth revoking
pub async fn revocable_by_common_name<C: ConnectionTrait>(
    db: &C,
    common_name: &str,
    kind: CertificateType,
) -> Result<Vec<certificate::Model>> {
    Ok(certificate::Entity::find()
        .filter(certificate::Column::CommonName.eq(common_name))
        .filter(certificate::Column::CertificateType.eq(kind))
        .filter(certificate::Column::Status.is_not_in([
            CertificateStatus::Revoked,
            CertificateStatus::Expired,
            CertificateStatus::Invalid,
        ]))
        .order_by_asc(certificate::Column::Id)
        .all(db)
        .await?)
}

/// Make the certificate's SAN edges exactly `domains`
pub async fn replace_edges<C: ConnectionTrait>(
    db: &C,
    certificate_id: i32,
    domains: &[domain::Model],
) -> Result<()> {
    certificate_domain::Entity::delete_many()
        .filter(certificate_domain::Column::CertificateId.eq(certificate_id))
        .exec(db)
        .await?;

    let mut seen = HashSet::new();
    let edges: Vec<certificate_domain::ActiveModel> = domains
        .iter()
        .filter(|d| seen.insert(d.id))
        .map(|d| certificate_domain::ActiveModel {
            certificate_id: sea_orm::Set(certificate_id),
            domain_id: sea_orm::Set(d.id),
        })
        .collect();

    if !edges.is_empty() {
        certificate_domain::Entity::insert_many(edges)
            .exec_without_returning(db)
            .await?;
    }
    Ok(())
}
