//! S/MIME client certificates for a user's e-mail address

use std::sync::Arc;

use certbroker_ca::{CertificateAuthority, SmimeEnrollRequest};
use certbroker_db::entities::certificate;
use certbroker_db::{normalize_serial, CertificateStatus, CertificateType};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{self, CertificateRecord};
use crate::error::{CertError, Result};
use crate::fanout::{fan_out, partition};
use crate::issuance::{
    cancelable, collect_chain, ensure_not_in_flight, idempotent, mark_revoked, parse_collected,
    record_issued, report_failures, set_status, IssuanceSettings, IssuedCertificate, RevokeOutcome,
};
use crate::x509::{canonical_pem, validate_csr};

#[derive(Debug, Clone)]
pub struct SmimeIssueRequest {
    pub csr: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub secondary_emails: Vec<String>,
    pub issuer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmimeRevokeSelector {
    Serial(String),
    Email(String),
}

fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(CertError::InvalidInput(format!("not an e-mail address: {:?}", raw))),
    }
}

#[derive(Clone)]
pub struct SmimeOrchestrator {
    db: DatabaseConnection,
    ca: Arc<dyn CertificateAuthority>,
    settings: IssuanceSettings,
}

impl SmimeOrchestrator {
    pub fn new(db: DatabaseConnection, ca: Arc<dyn CertificateAuthority>, settings: IssuanceSettings) -> Self {
        Self { db, ca, settings }
    }

    /// Enroll an S/MIME certificate for `request.email` and wait for it
    pub async fn issue(&self, request: SmimeIssueRequest, cancel: &CancellationToken) -> Result<IssuedCertificate> {
        validate_csr(&request.csr, self.settings.min_key_bits)?;
        let email = normalize_email(&request.email)?;
        let secondary_emails = request
            .secondary_emails
            .iter()
            .map(|e| normalize_email(e))
            .collect::<Result<Vec<_>>>()?;
        if request.first_name.trim().is_empty() || request.last_name.trim().is_empty() {
            return Err(CertError::InvalidInput("first and last name are required".into()));
        }
        let csr = canonical_pem(&request.csr);

        ensure_not_in_flight(&self.db, &csr).await?;
        let now = Utc::now();
        let certificate = certificate::ActiveModel {
            ssl_id: Set(None),
            serial: Set(None),
            common_name: Set(email.clone()),
            status: Set(CertificateStatus::Requested),
            certificate_type: Set(CertificateType::Smime),
            not_before: Set(None),
            not_after: Set(None),
            issued_by: Set(request.issuer.clone()),
            source: Set("smime".to_string()),
            created: Set(None),
            csr: Set(Some(csr.clone())),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        let profile = &self.settings.smime_profile;
        let enroll = SmimeEnrollRequest {
            org_id: profile.org_id,
            csr,
            cert_type: profile.cert_type,
            term: profile.term,
            email: email.clone(),
            first_name: request.first_name.trim().to_string(),
            last_name: request.last_name.trim().to_string(),
            secondary_emails,
        };

        let enrolled = match cancelable(cancel, self.ca.enroll_smime(&enroll)).await {
            Ok(enrolled) => enrolled,
            Err(CertError::Ca(e)) if !e.is_transient() => {
                warn!(id = certificate.id, email = %email, "CA refused S/MIME enrollment: {}", e);
                set_status(&self.db, certificate, CertificateStatus::Rejected).await?;
                return Err(CertError::Ca(e));
            }
            Err(e) => return Err(e),
        };

        let mut active = certificate.into_active_model();
        active.ssl_id = Set(Some(enrolled.order_number));
        active.status = Set(CertificateStatus::Applied);
        active.updated_at = Set(Utc::now());
        let certificate = active.update(&self.db).await?;
        info!(email = %email, order = enrolled.order_number, "S/MIME certificate enrolled");

        let ca = self.ca.clone();
        let backend_cert_id = enrolled.backend_cert_id.clone();
        let chain_pem = collect_chain(
            &self.settings,
            cancel,
            format!("smime order {}", enrolled.order_number),
            || {
                let ca = ca.clone();
                let backend_cert_id = backend_cert_id.clone();
                async move { ca.collect_smime(&backend_cert_id).await }
            },
        )
        .await?;

        let leaf = parse_collected(&chain_pem)?;
        let certificate = record_issued(&self.db, certificate, &leaf).await?;
        info!(email = %email, serial = %leaf.serial, "S/MIME certificate issued");

        Ok(IssuedCertificate {
            record: catalog::load_record(&self.db, certificate).await?,
            chain_pem,
        })
    }

    /// S/MIME certificates issued for `email`, newest first
    pub async fn list(&self, email: &str) -> Result<Vec<CertificateRecord>> {
        let certificates = certificate::Entity::find()
            .filter(certificate::Column::CertificateType.eq(CertificateType::Smime))
            .filter(certificate::Column::CommonName.eq(email.trim().to_ascii_lowercase()))
            .order_by_desc(certificate::Column::Id)
            .all(&self.db)
            .await?;

        Ok(certificates
            .into_iter()
            .map(|certificate| CertificateRecord {
                certificate,
                domains: Vec::new(),
            })
            .collect())
    }

    /// S/MIME certificate with `serial`, if it was issued for `email`
    pub async fn owned_by(&self, serial: &str, email: &str) -> Result<Option<certificate::Model>> {
        Ok(catalog::find_by_serial(&self.db, serial).await?.filter(|c| {
            c.certificate_type == CertificateType::Smime
                && c.common_name.eq_ignore_ascii_case(email.trim())
        }))
    }

    async fn revoke_serial(&self, serial: &str, reason: &str, cancel: &CancellationToken) -> Result<RevokeOutcome> {
        let serial = normalize_serial(serial);
        idempotent(cancelable(cancel, self.ca.revoke_smime_by_serial(&serial, reason)).await)?;
        if let Some(certificate) = catalog::find_by_serial(&self.db, &serial).await? {
            mark_revoked(&self.db, certificate).await?;
        }
        info!(serial = %serial, reason, "S/MIME certificate revoked");
        Ok(RevokeOutcome {
            revoked: vec![serial],
        })
    }

    /// Revoke by serial, or every live certificate for an e-mail address.
    /// Requests that never produced a serial are only closed locally.
    pub async fn revoke(
        &self,
        selector: &SmimeRevokeSelector,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<RevokeOutcome> {
        let email = match selector {
            SmimeRevokeSelector::Serial(serial) => return self.revoke_serial(serial, reason, cancel).await,
            SmimeRevokeSelector::Email(email) => email.trim().to_ascii_lowercase(),
        };

        let certificates = catalog::revocable_by_common_name(&self.db, &email, CertificateType::Smime).await?;
        // Only issued certificates have a serial the CA can revoke by
        let (certificates, pending): (Vec<_>, Vec<_>) =
            certificates.into_iter().partition(|c| c.serial.is_some());
        if certificates.is_empty() && pending.is_empty() {
            return Err(CertError::NotFound(format!("no live S/MIME certificate for {}", email)));
        }
        let mut closed = Vec::with_capacity(pending.len());
        for certificate in pending {
            closed.push(format!("#{}", certificate.id));
            mark_revoked(&self.db, certificate).await?;
        }

        let labels: Vec<String> = certificates
            .iter()
            .map(|c| c.serial.clone().unwrap_or_default())
            .collect();
        let ca = self.ca.clone();
        let db = self.db.clone();
        let reason = reason.to_string();

        let results = fan_out(certificates, self.settings.fan_out_limit, cancel, |certificate| {
            let ca = ca.clone();
            let db = db.clone();
            let reason = reason.clone();
            async move {
                let serial = certificate.serial.clone().unwrap_or_default();
                idempotent(ca.revoke_smime_by_serial(&serial, &reason).await.map_err(CertError::from))?;
                mark_revoked(&db, certificate).await?;
                Ok(serial)
            }
        })
        .await?;

        let total = labels.len();
        let (mut revoked, failures) = partition(&labels, results);
        report_failures(&email, total, &failures);
        CertError::aggregate(total, failures)?;

        revoked.extend(closed);
        info!(email = %email, count = revoked.len(), "S/MIME certificates revoked");
        Ok(RevokeOutcome { revoked })
    }
}
