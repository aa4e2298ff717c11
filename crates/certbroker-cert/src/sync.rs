//! Reconcile the CA's certificate inventory into the store
//!
//! The CA is authoritative. Every pass is idempotent, so an interrupted pass
//! is repaired by the next one.

use std::sync::Arc;

use certbroker_ca::{CertificateAuthority, SslCertificateDetails};
use certbroker_db::entities::certificate;
use certbroker_db::{normalize_serial, CertificateStatus, CertificateType};
use certbroker_domain::suffix::normalize_fqdn;
use certbroker_domain::upsert_domains;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::error::{CertError, ItemError, Result};
use crate::fanout::{fan_out, partition, DEFAULT_FAN_OUT_LIMIT};
use crate::issuance::cancelable;
use crate::x509::parse_leaf;

pub const SYNC_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: u32,
    pub fan_out_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: SYNC_PAGE_SIZE,
            fan_out_limit: DEFAULT_FAN_OUT_LIMIT,
        }
    }
}

/// Counts of one reconciliation pass. Failed items are listed, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub seen: usize,
    pub upserted: usize,
    pub failures: Vec<String>,
}

impl SyncReport {
    fn record_failures(&mut self, failures: Vec<ItemError>) {
        for failure in failures {
            warn!(item = %failure.item, "Sync failed: {}", failure.error);
            self.failures.push(failure.to_string());
        }
    }
}

/// What the CA knows about one certificate
#[derive(Debug, Clone)]
struct CaCertificate {
    details: SslCertificateDetails,
    serial: Option<String>,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive))
}

async fn fetch(ca: &dyn CertificateAuthority, ssl_id: i64) -> Result<CaCertificate> {
    let details = ca.ssl_details(ssl_id).await?;
    let mut fetched = CaCertificate {
        serial: details.serial_number.as_deref().map(normalize_serial),
        not_before: details.requested.and_then(start_of_day),
        not_after: details.expires.and_then(start_of_day),
        details,
    };

    // ACME orders come back without a request date; the certificate body
    // is the only place to learn when it became valid.
    if fetched.details.requested.is_none()
        && CertificateStatus::from_ca_status(&fetched.details.status) == CertificateStatus::Issued
    {
        debug!(ssl_id, "No request date, reading validity from the certificate");
        let leaf = parse_leaf(&ca.collect_ssl(ssl_id).await?)?;
        fetched.serial = Some(leaf.serial);
        fetched.not_before = Some(leaf.not_before);
        fetched.not_after = Some(leaf.not_after);
    }

    Ok(fetched)
}

fn san_names(details: &SslCertificateDetails) -> Vec<String> {
    details
        .domains()
        .iter()
        .filter_map(|name| match normalize_fqdn(name) {
            Ok(fqdn) => Some(fqdn),
            Err(e) => {
                warn!(ssl_id = details.ssl_id, name = %name, "Skipping SAN: {}", e);
                None
            }
        })
        .collect()
}

/// Insert or update the row for `fetched` and replace its SAN edges
async fn upsert<C: ConnectionTrait>(db: &C, fetched: &CaCertificate) -> Result<certificate::Model> {
    let details = &fetched.details;
    let status = CertificateStatus::from_ca_status(&details.status);

    let existing = match &fetched.serial {
        Some(serial) => catalog::find_by_serial(db, serial).await?,
        None => None,
    };
    let existing = match existing {
        Some(found) => Some(found),
        None => {
            certificate::Entity::find()
                .filter(certificate::Column::SslId.eq(details.ssl_id))
                .filter(certificate::Column::CertificateType.eq(CertificateType::Ssl))
                .order_by_desc(certificate::Column::Id)
                .one(db)
                .await?
        }
    };

    let domains = upsert_domains(db, &san_names(details), "").await?;
    let now = Utc::now();

    let saved = match existing {
        Some(stored) => {
            let stored_status = stored.status;
            let created_missing = stored.created.is_none();
            let issued_by_missing = stored.issued_by.is_empty();

            let mut active = stored.into_active_model();
            active.ssl_id = Set(Some(details.ssl_id));
            if !details.common_name.is_empty() {
                active.common_name = Set(details.common_name.to_ascii_lowercase());
            }
            match stored_status.transition(status) {
                Ok(_) => active.status = Set(status),
                Err(e) => warn!(ssl_id = details.ssl_id, "Keeping local status: {}", e),
            }
            if stored_status != CertificateStatus::Issued {
                if fetched.serial.is_some() {
                    active.serial = Set(fetched.serial.clone());
                }
                if fetched.not_after.is_some() {
                    active.not_after = Set(fetched.not_after);
                }
            }
            if fetched.not_before.is_some() {
                active.not_before = Set(fetched.not_before);
                if created_missing {
                    active.created = Set(fetched.not_before);
                }
            }
            if issued_by_missing {
                active.issued_by = Set(details.issued_by());
            }
            active.updated_at = Set(now);
            active.update(db).await?
        }
        None => {
            certificate::ActiveModel {
                ssl_id: Set(Some(details.ssl_id)),
                serial: Set(fetched.serial.clone()),
                common_name: Set(details.common_name.to_ascii_lowercase()),
                status: Set(status),
                certificate_type: Set(CertificateType::Ssl),
                not_before: Set(fetched.not_before),
                not_after: Set(fetched.not_after),
                issued_by: Set(details.issued_by()),
                source: Set("sync".to_string()),
                created: Set(fetched.not_before),
                csr: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(db)
            .await?
        }
    };

    catalog::replace_edges(db, saved.id, &domains).await?;
    Ok(saved)
}

#[derive(Clone)]
pub struct CertificateSyncer {
    db: DatabaseConnection,
    ca: Arc<dyn CertificateAuthority>,
    settings: SyncSettings,
}

impl CertificateSyncer {
    pub fn new(db: DatabaseConnection, ca: Arc<dyn CertificateAuthority>, settings: SyncSettings) -> Self {
        Self { db, ca, settings }
    }

    /// Walk the CA inventory page by page and upsert every certificate.
    ///
    /// Details of one page are fetched concurrently; rows are written one at
    /// a time, each with its edges in one transaction.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let page_size = self.settings.page_size.max(1);
        let mut report = SyncReport::default();
        let mut position: u32 = 0;

        loop {
            let page = cancelable(cancel, self.ca.list_ssl(page_size, position)).await?;
            if page.items.is_empty() {
                break;
            }
            let count = page.items.len();
            report.seen += count;
            debug!(position, count, total = ?page.total, "Fetched inventory page");

            let labels: Vec<String> = page.items.iter().map(|i| format!("ssl {}", i.ssl_id)).collect();
            let ca = self.ca.clone();
            let results = fan_out(page.items, self.settings.fan_out_limit, cancel, |item| {
                let ca = ca.clone();
                async move { fetch(ca.as_ref(), item.ssl_id).await }
            })
            .await?;

            let (fetched, failures) = partition(&labels, results);
            report.record_failures(failures);

            for certificate in fetched {
                if cancel.is_cancelled() {
                    return Err(CertError::Canceled);
                }
                match self.upsert_one(&certificate).await {
                    Ok(()) => report.upserted += 1,
                    Err(error) => report.record_failures(vec![ItemError {
                        item: format!("ssl {}", certificate.details.ssl_id),
                        error,
                    }]),
                }
            }

            position = position.saturating_add(count as u32);
            let done = match page.total {
                Some(total) => u64::from(position) >= total,
                // without a count, a short page is the last one
                None => count < page_size as usize,
            };
            if done {
                break;
            }
        }

        info!(
            seen = report.seen,
            upserted = report.upserted,
            failed = report.failures.len(),
            "Certificate sync finished"
        );
        Ok(report)
    }

    async fn upsert_one(&self, fetched: &CaCertificate) -> Result<()> {
        let txn = self.db.begin().await?;
        upsert(&txn, fetched).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Backfill the CA id of certificates that only have a serial, such as
    /// those issued through ACME.
    pub async fn sync_pending(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let pending = certificate::Entity::find()
            .filter(certificate::Column::SslId.is_null())
            .filter(certificate::Column::Serial.is_not_null())
            .filter(certificate::Column::CertificateType.eq(CertificateType::Ssl))
            .all(&self.db)
            .await?;

        let mut report = SyncReport {
            seen: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let labels: Vec<String> = pending.iter().map(|c| c.serial.clone().unwrap_or_default()).collect();
        let ca = self.ca.clone();
        let results = fan_out(pending, self.settings.fan_out_limit, cancel, |certificate| {
            let ca = ca.clone();
            async move {
                let serial = certificate.serial.clone().unwrap_or_default();
                let found = ca.find_ssl_by_serial(&serial).await?;
                Ok((certificate, found))
            }
        })
        .await?;

        let (found, failures) = partition(&labels, results);
        report.record_failures(failures);

        for (certificate, item) in found {
            let Some(item) = item else {
                debug!(serial = ?certificate.serial, "Not known to the CA yet");
                continue;
            };
            let label = certificate.serial.clone().unwrap_or_default();
            let mut active = certificate.into_active_model();
            active.ssl_id = Set(Some(item.ssl_id));
            active.updated_at = Set(Utc::now());
            match active.update(&self.db).await {
                Ok(_) => report.upserted += 1,
                Err(error) => report.record_failures(vec![ItemError {
                    item: label,
                    error: error.into(),
                }]),
            }
        }

        info!(pending = report.seen, backfilled = report.upserted, "Pending certificates synced");
        Ok(report)
    }
}
