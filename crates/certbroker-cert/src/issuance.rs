//! SSL enrollment, collection and revocation against the CA

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use certbroker_ca::{CaError, CertificateAuthority, EnrollmentProfile, SslEnrollRequest};
use certbroker_db::entities::certificate;
use certbroker_db::{normalize_serial, CertificateStatus, CertificateType};
use certbroker_domain::suffix::normalize_fqdn;
use certbroker_domain::upsert_requested_domains;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{self, CertificateRecord};
use crate::error::{CertError, ItemError, Result};
use crate::fanout::{fan_out, partition, DEFAULT_FAN_OUT_LIMIT};
use crate::wait::{wait_for, Progress, WaitError};
use crate::x509::{canonical_pem, parse_leaf, validate_csr, ParsedCertificate, MIN_RSA_KEY_BITS};

/// Polling and enrollment parameters
#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub collect_timeout: Duration,
    pub collect_interval: Duration,
    pub min_key_bits: usize,
    pub fan_out_limit: usize,
    pub ssl_profile: EnrollmentProfile,
    pub smime_profile: EnrollmentProfile,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            collect_timeout: Duration::from_secs(300),
            collect_interval: Duration::from_secs(1),
            min_key_bits: MIN_RSA_KEY_BITS,
            fan_out_limit: DEFAULT_FAN_OUT_LIMIT,
            ssl_profile: EnrollmentProfile::default(),
            smime_profile: EnrollmentProfile::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub csr: String,
    pub sans: Vec<String>,
    /// Requesting user, owner of any SAN domain created for the request
    pub issuer: String,
    /// Mailbox of the requester. Stored as `issued_by` and sent to the CA,
    /// so expiry notices reach a person.
    pub requester: Option<String>,
    /// Channel the request came in on (api, acme, ...)
    pub source: String,
    pub comments: Option<String>,
}

impl IssueRequest {
    /// Requester mailbox when known, the user id otherwise
    pub fn issued_by(&self) -> &str {
        self.requester
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.issuer)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedCertificate {
    #[serde(flatten)]
    pub record: CertificateRecord,
    /// Chain as returned by the CA, leaf first
    pub chain_pem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeSelector {
    Serial(String),
    CommonName(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevokeOutcome {
    /// Serials (or `#id` for certificates without one) now revoked
    pub revoked: Vec<String>,
}

/// Race `work` against `cancel`
pub(crate) async fn cancelable<T, E>(
    cancel: &CancellationToken,
    work: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: Into<CertError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(CertError::Canceled),
        result = work => result.map_err(Into::into),
    }
}

/// Poll `collect` until the CA hands out the chain
pub(crate) async fn collect_chain<F, Fut>(
    settings: &IssuanceSettings,
    cancel: &CancellationToken,
    order: String,
    collect: F,
) -> Result<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<String, CaError>>,
{
    let mut collect = collect;
    let polling = wait_for(settings.collect_timeout, settings.collect_interval, || {
        let attempt = collect();
        async move {
            match attempt.await {
                Ok(pem) => Ok(Progress::Done(pem)),
                Err(e) if e.is_still_processing() => Ok(Progress::Pending(Some(e))),
                Err(e) => Err(e),
            }
        }
    });

    let outcome = tokio::select! {
        _ = cancel.cancelled() => return Err(CertError::Canceled),
        outcome = polling => outcome,
    };
    match outcome {
        Ok(pem) => Ok(pem),
        Err(WaitError::Aborted(e)) => Err(e.into()),
        Err(WaitError::Timeout { elapsed, last }) => Err(CertError::Timeout {
            operation: format!("collection of {}", order),
            elapsed,
            last: last.map(|e| e.to_string()),
        }),
    }
}

/// Parse what the CA returned; a chain we cannot read is the CA's fault
pub(crate) fn parse_collected(pem: &str) -> Result<ParsedCertificate> {
    parse_leaf(pem).map_err(|e| CertError::Internal(format!("CA returned an unreadable chain: {}", e)))
}

/// Lowercase, validate and deduplicate, keeping order
pub(crate) fn normalize_sans(sans: &[String]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(sans.len());
    for san in sans {
        let fqdn = normalize_fqdn(san)?;
        if !normalized.contains(&fqdn) {
            normalized.push(fqdn);
        }
    }
    if normalized.is_empty() {
        return Err(CertError::InvalidInput("at least one SAN is required".into()));
    }
    Ok(normalized)
}

pub(crate) async fn set_status<C: ConnectionTrait>(
    db: &C,
    certificate: certificate::Model,
    status: CertificateStatus,
) -> Result<certificate::Model> {
    let mut active = certificate.into_active_model();
    active.status = Set(status);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

/// Mark revoked locally unless the row already left the lifecycle
pub(crate) async fn mark_revoked<C: ConnectionTrait>(db: &C, certificate: certificate::Model) -> Result<()> {
    if let Err(e) = certificate.status.transition(CertificateStatus::Revoked) {
        debug!(id = certificate.id, "Not marking certificate revoked: {}", e);
        return Ok(());
    }
    set_status(db, certificate, CertificateStatus::Revoked).await?;
    Ok(())
}

/// Store what the issued leaf says and move the row to `Issued`
pub(crate) async fn record_issued<C: ConnectionTrait>(
    db: &C,
    certificate: certificate::Model,
    leaf: &ParsedCertificate,
) -> Result<certificate::Model> {
    let mut active = certificate.into_active_model();
    active.serial = Set(Some(leaf.serial.clone()));
    active.not_before = Set(Some(leaf.not_before));
    active.not_after = Set(Some(leaf.not_after));
    active.created = Set(Some(leaf.not_before));
    active.status = Set(CertificateStatus::Issued);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

/// Error for an identical CSR that is still being processed
pub(crate) async fn ensure_not_in_flight<C: ConnectionTrait>(db: &C, csr: &str) -> Result<()> {
    let in_flight = certificate::Entity::find()
        .filter(certificate::Column::Csr.eq(csr))
        .filter(certificate::Column::Status.is_in([
            CertificateStatus::Init,
            CertificateStatus::Requested,
            CertificateStatus::Applied,
            CertificateStatus::Approved,
            CertificateStatus::SAApproved,
        ]))
        .one(db)
        .await?;

    match in_flight {
        Some(existing) => Err(CertError::Conflict(format!(
            "an identical CSR is already being processed (certificate {})",
            existing.id
        ))),
        None => Ok(()),
    }
}

/// Drives SSL certificates through enrollment, collection and revocation
#[derive(Clone)]
pub struct CertificateOrchestrator {
    db: DatabaseConnection,
    ca: Arc<dyn CertificateAuthority>,
    settings: IssuanceSettings,
}

impl CertificateOrchestrator {
    pub fn new(db: DatabaseConnection, ca: Arc<dyn CertificateAuthority>, settings: IssuanceSettings) -> Self {
        Self { db, ca, settings }
    }

    pub fn settings(&self) -> &IssuanceSettings {
        &self.settings
    }

    /// Validate the CSR, record the request, enroll and wait for the chain.
    ///
    /// The local row exists before the CA is contacted. If collection times
    /// out the row stays `Applied` and a later sync picks the certificate up.
    pub async fn issue(&self, request: IssueRequest, cancel: &CancellationToken) -> Result<IssuedCertificate> {
        let csr_info = validate_csr(&request.csr, self.settings.min_key_bits)?;
        let sans = normalize_sans(&request.sans)?;
        let csr = canonical_pem(&request.csr);
        let common_name = csr_info
            .common_name
            .map(|cn| cn.trim().to_ascii_lowercase())
            .filter(|cn| !cn.is_empty())
            .unwrap_or_else(|| sans[0].clone());

        let certificate = self.record_request(&csr, &sans, &common_name, &request).await?;
        info!(id = certificate.id, common_name = %common_name, sans = sans.len(), "Certificate requested");

        let mut enroll = SslEnrollRequest::new(&self.settings.ssl_profile, &csr, &sans, request.issued_by());
        if let Some(comments) = &request.comments {
            enroll = enroll.with_comments(comments.clone());
        }

        let enrolled = match cancelable(cancel, self.ca.enroll_ssl(&enroll)).await {
            Ok(enrolled) => enrolled,
            Err(CertError::Ca(e)) if !e.is_transient() => {
                warn!(id = certificate.id, "CA refused enrollment: {}", e);
                set_status(&self.db, certificate, CertificateStatus::Rejected).await?;
                return Err(CertError::Ca(e));
            }
            Err(e) => return Err(e),
        };
        let ssl_id = enrolled.ssl_id;

        let mut active = certificate.into_active_model();
        active.ssl_id = Set(Some(ssl_id));
        active.status = Set(CertificateStatus::Applied);
        active.updated_at = Set(Utc::now());
        let certificate = active.update(&self.db).await?;
        info!(id = certificate.id, ssl_id, "Certificate enrolled");

        let ca = self.ca.clone();
        let chain_pem = collect_chain(&self.settings, cancel, format!("ssl order {}", ssl_id), || {
            let ca = ca.clone();
            async move { ca.collect_ssl(ssl_id).await }
        })
        .await?;

        let leaf = parse_collected(&chain_pem)?;
        let certificate = record_issued(&self.db, certificate, &leaf).await?;
        info!(ssl_id, serial = %leaf.serial, "Certificate issued");

        Ok(IssuedCertificate {
            record: catalog::load_record(&self.db, certificate).await?,
            chain_pem,
        })
    }

    /// Domain rows, certificate row and SAN edges in one transaction
    async fn record_request(
        &self,
        csr: &str,
        sans: &[String],
        common_name: &str,
        request: &IssueRequest,
    ) -> Result<certificate::Model> {
        let txn = self.db.begin().await?;
        ensure_not_in_flight(&txn, csr).await?;

        let domains = upsert_requested_domains(&txn, sans, &request.issuer).await?;

        let now = Utc::now();
        let certificate = certificate::ActiveModel {
            ssl_id: Set(None),
            serial: Set(None),
            common_name: Set(common_name.to_string()),
            status: Set(CertificateStatus::Requested),
            certificate_type: Set(CertificateType::Ssl),
            not_before: Set(None),
            not_after: Set(None),
            issued_by: Set(request.issued_by().to_string()),
            source: Set(request.source.clone()),
            created: Set(None),
            csr: Set(Some(csr.to_string())),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        catalog::replace_edges(&txn, certificate.id, &domains).await?;
        txn.commit().await?;
        Ok(certificate)
    }

    /// Revoke one certificate by serial, or every live certificate for a
    /// common name concurrently.
    ///
    /// "Already revoked" answers count as success. For a common name all
    /// certificates are attempted and failures are reported together.
    pub async fn revoke(
        &self,
        selector: &RevokeSelector,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<RevokeOutcome> {
        match selector {
            RevokeSelector::Serial(serial) => {
                let serial = normalize_serial(serial);
                idempotent(cancelable(cancel, self.ca.revoke_ssl_by_serial(&serial, reason)).await)?;

                if let Some(certificate) = catalog::find_by_serial(&self.db, &serial).await? {
                    mark_revoked(&self.db, certificate).await?;
                }
                info!(serial = %serial, reason, "Certificate revoked");
                Ok(RevokeOutcome {
                    revoked: vec![serial],
                })
            }
            RevokeSelector::CommonName(common_name) => {
                let common_name = common_name.trim().to_ascii_lowercase();
                let certificates =
                    catalog::revocable_by_common_name(&self.db, &common_name, CertificateType::Ssl).await?;
                if certificates.is_empty() {
                    return Err(CertError::NotFound(format!(
                        "no live certificate for {}",
                        common_name
                    )));
                }

                let labels: Vec<String> = certificates.iter().map(label).collect();
                let ca = self.ca.clone();
                let db = self.db.clone();
                let reason = reason.to_string();

                let results = fan_out(certificates, self.settings.fan_out_limit, cancel, |certificate| {
                    let ca = ca.clone();
                    let db = db.clone();
                    let reason = reason.clone();
                    async move { revoke_ssl_one(ca.as_ref(), &db, certificate, &reason).await }
                })
                .await?;

                let total = labels.len();
                let (revoked, failures) = partition(&labels, results);
                report_failures(&common_name, total, &failures);
                CertError::aggregate(total, failures)?;

                info!(common_name = %common_name, count = revoked.len(), "Certificates revoked");
                Ok(RevokeOutcome { revoked })
            }
        }
    }
}

fn label(certificate: &certificate::Model) -> String {
    certificate
        .serial
        .clone()
        .unwrap_or_else(|| format!("#{}", certificate.id))
}

/// Treat the CA's "already revoked" answer as success
pub(crate) fn idempotent(result: Result<()>) -> Result<()> {
    match result {
        Err(CertError::Ca(e)) if e.is_already_revoked() => {
            debug!("Certificate was already revoked at the CA");
            Ok(())
        }
        other => other,
    }
}

pub(crate) fn report_failures(subject: &str, total: usize, failures: &[ItemError]) {
    for failure in failures {
        warn!(subject, item = %failure.item, "Revocation failed: {}", failure.error);
    }
    if !failures.is_empty() {
        warn!(subject, failed = failures.len(), total, "Revocation partially failed");
    }
}

async fn revoke_ssl_one(
    ca: &dyn CertificateAuthority,
    db: &DatabaseConnection,
    certificate: certificate::Model,
    reason: &str,
) -> Result<String> {
    let result = match (certificate.ssl_id, certificate.serial.as_deref()) {
        (Some(ssl_id), _) => ca.revoke_ssl(ssl_id, reason).await,
        (None, Some(serial)) => ca.revoke_ssl_by_serial(serial, reason).await,
        // Never reached the CA
        (None, None) => Ok(()),
    };
    idempotent(result.map_err(CertError::from))?;

    let revoked = label(&certificate);
    mark_revoked(db, certificate).await?;
    Ok(revoked)
}
