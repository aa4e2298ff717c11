//! CNAME-based domain control validation
//!
//! One cycle: ask the CA for a challenge, publish the CNAME in the zone that
//! serves the challenge host, tell the CA it is there, poll until the CA
//! reports the domain validated, then remove the record again.

use std::sync::Arc;
use std::time::Duration;

use certbroker_ca::{CertificateAuthority, CnameChallenge, DcvStatus};
use certbroker_dns::record::{absolute, qualify, DEFAULT_TTL};
use certbroker_dns::{DnsError, DnsRecord, DnsService, ZoneRouter};
use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CertError, Result};
use crate::fanout::{fan_out, partition, DEFAULT_FAN_OUT_LIMIT};
use crate::issuance::cancelable;
use crate::wait::{wait_for, Progress, WaitError};

#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub status_timeout: Duration,
    pub status_interval: Duration,
    /// Revalidate domains whose validation lapses within this many days
    pub horizon_days: u64,
    pub page_size: u32,
    pub record_ttl: u32,
    pub fan_out_limit: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(600),
            status_interval: Duration::from_secs(10),
            horizon_days: 30,
            page_size: 200,
            record_ttl: DEFAULT_TTL,
            fan_out_limit: DEFAULT_FAN_OUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub candidates: usize,
    pub validated: Vec<String>,
    pub failures: Vec<String>,
}

/// The challenge record as published, so cleanup removes exactly it
struct PublishedChallenge {
    zone: String,
    service: Arc<dyn DnsService>,
    record: DnsRecord,
}

#[derive(Clone)]
pub struct DomainValidationOrchestrator {
    ca: Arc<dyn CertificateAuthority>,
    dns: ZoneRouter,
    settings: ValidationSettings,
}

impl DomainValidationOrchestrator {
    pub fn new(ca: Arc<dyn CertificateAuthority>, dns: ZoneRouter, settings: ValidationSettings) -> Self {
        Self { ca, dns, settings }
    }

    /// Run one validation cycle for `domain`. The challenge record is
    /// removed whether or not validation succeeded.
    pub async fn validate(&self, domain: &str, cancel: &CancellationToken) -> Result<DcvStatus> {
        let challenge = cancelable(cancel, self.ca.start_cname_validation(domain)).await?;
        debug!(domain, host = %challenge.host, point = %challenge.point, "CNAME challenge issued");

        let published = self.publish(&challenge).await?;
        let outcome = self.confirm(domain, cancel).await;
        self.cleanup(&published).await;

        match &outcome {
            Ok(_) => info!(domain, "Domain validated"),
            Err(e) => warn!(domain, "Domain validation failed: {}", e),
        }
        outcome
    }

    async fn publish(&self, challenge: &CnameChallenge) -> Result<PublishedChallenge> {
        let (zone, service) = self
            .dns
            .resolve(&challenge.host)
            .ok_or_else(|| DnsError::NoZone(challenge.host.clone()))?;
        let zone = zone.to_string();

        // the point lives under the CA's domain, not ours
        let record = DnsRecord::cname(
            qualify(&challenge.host, &zone),
            absolute(&challenge.point),
            self.settings.record_ttl,
        );
        service.add(&zone, std::slice::from_ref(&record)).await?;
        debug!(zone = %zone, name = %record.name, "Challenge record published");

        Ok(PublishedChallenge { zone, service, record })
    }

    async fn confirm(&self, domain: &str, cancel: &CancellationToken) -> Result<DcvStatus> {
        let submitted = cancelable(cancel, self.ca.submit_cname_validation(domain)).await?;
        debug!(domain, status = %submitted.status, "Challenge submitted");

        let ca = self.ca.clone();
        let polling = wait_for(self.settings.status_timeout, self.settings.status_interval, || {
            let ca = ca.clone();
            let domain = domain.to_string();
            async move {
                match ca.dcv_status(&domain).await {
                    Ok(status) if status.is_validated() => Ok(Progress::Done(status)),
                    Ok(status) => {
                        debug!(domain = %domain, status = %status.status, "Not validated yet");
                        Ok(Progress::Pending(None))
                    }
                    Err(e) => {
                        warn!(domain = %domain, "Validation status check failed: {}", e);
                        Ok(Progress::Pending(Some(e)))
                    }
                }
            }
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(CertError::Canceled),
            outcome = polling => outcome,
        };
        match outcome {
            Ok(status) => Ok(status),
            Err(WaitError::Aborted(e)) => Err(e.into()),
            Err(WaitError::Timeout { elapsed, last }) => Err(CertError::Timeout {
                operation: format!("validation of {}", domain),
                elapsed,
                last: last.map(|e| e.to_string()),
            }),
        }
    }

    /// Delete every record in the zone matching the published challenge
    async fn cleanup(&self, published: &PublishedChallenge) {
        let zone = &published.zone;
        let records = match published.service.list(zone).await {
            Ok(records) => records,
            Err(e) => {
                warn!(zone = %zone, name = %published.record.name, "Challenge cleanup skipped: {}", e);
                return;
            }
        };

        let stale: Vec<DnsRecord> = records
            .into_iter()
            .filter(|r| r.same_entry(&published.record, zone))
            .collect();
        if stale.is_empty() {
            debug!(zone = %zone, name = %published.record.name, "Challenge record already gone");
            return;
        }

        match published.service.delete(zone, &stale).await {
            Ok(()) => debug!(zone = %zone, count = stale.len(), "Challenge records removed"),
            Err(e) => warn!(zone = %zone, name = %published.record.name, "Challenge cleanup failed: {}", e),
        }
    }

    /// Domains the CA lists as unvalidated or lapsing soon, limited to
    /// those a configured zone can publish challenges for
    pub async fn candidates(&self, today: NaiveDate, cancel: &CancellationToken) -> Result<Vec<String>> {
        let horizon = today
            .checked_add_days(Days::new(self.settings.horizon_days))
            .unwrap_or(today);
        let page_size = self.settings.page_size.max(1);

        let mut candidates = Vec::new();
        let mut position: u32 = 0;
        loop {
            let page = cancelable(cancel, self.ca.list_dcv(page_size, position)).await?;
            let count = page.len();
            for validation in page {
                if !validation.needs_validation(horizon) {
                    continue;
                }
                let domain = validation.domain.trim().trim_end_matches('.').to_ascii_lowercase();
                if self.dns.resolve(&domain).is_none() {
                    debug!(domain = %domain, "No managed zone, skipping validation");
                    continue;
                }
                if !candidates.contains(&domain) {
                    candidates.push(domain);
                }
            }
            if count < page_size as usize {
                break;
            }
            position = position.saturating_add(count as u32);
        }
        Ok(candidates)
    }

    /// Validate every candidate domain concurrently
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ValidationReport> {
        let candidates = self.candidates(Utc::now().date_naive(), cancel).await?;
        let mut report = ValidationReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            info!("No domains need validation");
            return Ok(report);
        }

        let orchestrator = self.clone();
        let child = cancel.child_token();
        let results = fan_out(candidates.clone(), self.settings.fan_out_limit, cancel, |domain| {
            let orchestrator = orchestrator.clone();
            let cancel = child.clone();
            async move {
                orchestrator.validate(&domain, &cancel).await?;
                Ok(domain)
            }
        })
        .await?;

        let (validated, failures) = partition(&candidates, results);
        report.validated = validated;
        report.failures = failures.iter().map(ToString::to_string).collect();

        info!(
            candidates = report.candidates,
            validated = report.validated.len(),
            failed = report.failures.len(),
            "Domain validation run finished"
        );
        Ok(report)
    }
}
