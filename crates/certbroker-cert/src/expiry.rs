//! Expiry reminders and the Issued -> Expired sweep

use std::sync::Arc;

use async_trait::async_trait;
use certbroker_db::entities::{certificate, domain};
use certbroker_db::CertificateStatus;
use chrono::{DateTime, Duration, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CertError, Result};

/// One reminder about a certificate that is about to expire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiryNotice {
    pub recipient: String,
    pub domain: String,
    pub serial: Option<String>,
    pub common_name: String,
    pub not_after: DateTime<Utc>,
    pub days_remaining: i64,
}

impl ExpiryNotice {
    pub fn subject(&self) -> String {
        format!(
            "Certificate for {} expires in {} days",
            self.domain, self.days_remaining
        )
    }

    pub fn body(&self) -> String {
        format!(
            "The certificate for {domain} (common name {cn}, serial {serial}) expires on {date}.\n\
             Request a replacement before then to avoid an outage.\n",
            domain = self.domain,
            cn = self.common_name,
            serial = self.serial.as_deref().unwrap_or("unknown"),
            date = self.not_after.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notice: &ExpiryNotice) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    /// STARTTLS on the submission port; plain SMTP otherwise
    pub starttls: bool,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            from: "certbroker@localhost".to_string(),
            starttls: true,
        }
    }
}

/// Sends notices through an SMTP relay
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let mut builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| CertError::Mail(format!("SMTP relay {}: {}", settings.host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        if let Some(port) = settings.port {
            builder = builder.port(port);
        }
        if let Some(username) = &settings.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            ));
        }

        let from = settings
            .from
            .parse::<Mailbox>()
            .map_err(|e| CertError::Mail(format!("sender {}: {}", settings.from, e)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, notice: &ExpiryNotice) -> Result<()> {
        let to = notice
            .recipient
            .parse::<Mailbox>()
            .map_err(|e| CertError::Mail(format!("recipient {}: {}", notice.recipient, e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notice.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(notice.body())
            .map_err(|e| CertError::Mail(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| CertError::Mail(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub window_days: i64,
    pub cadence_days: i64,
    /// Send every notice here instead of to the requester
    pub override_recipient: Option<String>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            window_days: 30,
            cadence_days: 7,
            override_recipient: None,
        }
    }
}

impl NotifySettings {
    /// Days remaining if a reminder is due today
    pub fn due(&self, now: DateTime<Utc>, not_after: DateTime<Utc>) -> Option<i64> {
        if not_after <= now || not_after >= now + Duration::days(self.window_days) {
            return None;
        }
        let days = (not_after - now).num_days();
        (days % self.cadence_days.max(1) == 0).then_some(days)
    }

    fn recipient(&self, issued_by: &str) -> Option<String> {
        if let Some(recipient) = &self.override_recipient {
            return Some(recipient.clone());
        }
        issued_by
            .split_whitespace()
            .next()
            .filter(|token| token.contains('@'))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub domains: usize,
    pub sent: usize,
    pub failures: Vec<String>,
}

/// Mails requesters about certificates entering the expiry window.
///
/// Running twice on the same day sends twice.
pub struct ExpiryNotifier {
    db: DatabaseConnection,
    mailer: Arc<dyn Mailer>,
    settings: NotifySettings,
}

impl ExpiryNotifier {
    pub fn new(db: DatabaseConnection, mailer: Arc<dyn Mailer>, settings: NotifySettings) -> Self {
        Self { db, mailer, settings }
    }

    /// Notices due at `now`, one per domain for its latest certificate
    pub async fn pending_notices(&self, now: DateTime<Utc>) -> Result<Vec<ExpiryNotice>> {
        let graph = domain::Entity::find()
            .find_with_related(certificate::Entity)
            .all(&self.db)
            .await?;

        let mut notices = Vec::new();
        for (domain, certificates) in graph {
            let latest = certificates
                .into_iter()
                .filter(|c| !matches!(c.status, CertificateStatus::Revoked | CertificateStatus::Invalid))
                .filter_map(|c| c.not_after.map(|not_after| (not_after, c)))
                .max_by_key(|(not_after, _)| *not_after);

            let Some((not_after, certificate)) = latest else {
                continue;
            };
            let Some(days_remaining) = self.settings.due(now, not_after) else {
                continue;
            };
            let Some(recipient) = self.settings.recipient(&certificate.issued_by) else {
                warn!(domain = %domain.fqdn, issued_by = %certificate.issued_by, "No recipient for expiry notice");
                continue;
            };

            notices.push(ExpiryNotice {
                recipient,
                domain: domain.fqdn,
                serial: certificate.serial,
                common_name: certificate.common_name,
                not_after,
                days_remaining,
            });
        }
        Ok(notices)
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<NotifyReport> {
        let notices = self.pending_notices(now).await?;
        let mut report = NotifyReport {
            domains: notices.len(),
            ..Default::default()
        };

        for notice in &notices {
            match self.mailer.send(notice).await {
                Ok(()) => {
                    debug!(domain = %notice.domain, recipient = %notice.recipient, "Expiry notice sent");
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(domain = %notice.domain, recipient = %notice.recipient, "Expiry notice failed: {}", e);
                    report.failures.push(format!("{}: {}", notice.domain, e));
                }
            }
        }

        info!(due = report.domains, sent = report.sent, "Expiry notification finished");
        Ok(report)
    }
}

/// Moves issued certificates past their `not_after` to `Expired`
pub struct ExpirySweep {
    db: DatabaseConnection,
}

impl ExpirySweep {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = certificate::Entity::find()
            .filter(certificate::Column::Status.eq(CertificateStatus::Issued))
            .filter(certificate::Column::NotAfter.lt(now))
            .all(&self.db)
            .await?;

        let count = expired.len();
        for certificate in expired {
            debug!(id = certificate.id, serial = ?certificate.serial, "Certificate expired");
            let mut active = certificate.into_active_model();
            active.status = Set(CertificateStatus::Expired);
            active.updated_at = Set(now);
            active.update(&self.db).await?;
        }

        if count > 0 {
            info!(count, "Marked certificates expired");
        }
        Ok(count)
    }
}
