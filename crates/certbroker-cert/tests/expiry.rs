//! Expiry notification cadence and the expiry sweep

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use certbroker_cert::{CertError, ExpiryNotice, ExpiryNotifier, ExpirySweep, Mailer, NotifySettings};
use certbroker_db::entities::certificate;
use certbroker_db::CertificateStatus;
use chrono::{Duration, TimeZone, Utc};
use common::*;
use mockall::mock;
use sea_orm::EntityTrait;

mock! {
    pub Mailer {}

    #[async_trait]
    impl Mailer for Mailer {
        async fn send(&self, notice: &ExpiryNotice) -> Result<(), CertError>;
    }
}

#[tokio::test]
async fn test_latest_live_certificate_per_domain() {
    let db = setup_test_db().await;
    let now = Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap();

    // Due in 14 days; a revoked certificate with a later expiry is ignored
    let www = seed_domain(&db, "www.example.com", "alice").await;
    seed_certificate(
        &db,
        SeedCertificate {
            serial: Some("01"),
            not_after: Some(now + Duration::days(14)),
            issued_by: "alice@example.com Alice",
            ..Default::default()
        },
        &[&www],
    )
    .await;
    seed_certificate(
        &db,
        SeedCertificate {
            serial: Some("02"),
            status: CertificateStatus::Revoked,
            not_after: Some(now + Duration::days(300)),
            ..Default::default()
        },
        &[&www],
    )
    .await;

    // Renewed: the latest certificate is far from expiry
    let api = seed_domain(&db, "api.example.com", "alice").await;
    seed_certificate(
        &db,
        SeedCertificate {
            serial: Some("03"),
            common_name: "api.example.com",
            not_after: Some(now + Duration::days(7)),
            ..Default::default()
        },
        &[&api],
    )
    .await;
    seed_certificate(
        &db,
        SeedCertificate {
            serial: Some("04"),
            common_name: "api.example.com",
            not_after: Some(now + Duration::days(90)),
            ..Default::default()
        },
        &[&api],
    )
    .await;

    // Inside the window but off cadence
    let mail = seed_domain(&db, "mail.example.com", "alice").await;
    seed_certificate(
        &db,
        SeedCertificate {
            serial: Some("05"),
            common_name: "mail.example.com",
            not_after: Some(now + Duration::days(13)),
            ..Default::default()
        },
        &[&mail],
    )
    .await;

    let mut mailer = MockMailer::new();
    mailer
        .expect_send()
        .withf(|notice| {
            notice.domain == "www.example.com"
                && notice.recipient == "alice@example.com"
                && notice.days_remaining == 14
                && notice.serial.as_deref() == Some("01")
        })
        .times(1)
        .returning(|_| Ok(()));

    let notifier = ExpiryNotifier::new(db.clone(), Arc::new(mailer), NotifySettings::default());
    let report = notifier.run(now).await.unwrap();
    assert_eq!(report.domains, 1);
    assert_eq!(report.sent, 1);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_override_recipient_and_failed_delivery() {
    let db = setup_test_db().await;
    let now = Utc::now();
    let www = seed_domain(&db, "www.example.com", "alice").await;
    seed_certificate(
        &db,
        SeedCertificate {
            serial: Some("01"),
            not_after: Some(now + Duration::days(21) + Duration::hours(1)),
            issued_by: "alice",
            ..Default::default()
        },
        &[&www],
    )
    .await;

    let mut mailer = MockMailer::new();
    mailer
        .expect_send()
        .withf(|notice| notice.recipient == "pki@example.com")
        .times(1)
        .returning(|_| Err(CertError::Mail("relay refused".into())));

    let settings = NotifySettings {
        override_recipient: Some("pki@example.com".into()),
        ..Default::default()
    };
    let notifier = ExpiryNotifier::new(db.clone(), Arc::new(mailer), settings);
    let report = notifier.run(now).await.unwrap();
    assert_eq!(report.sent, 0);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn test_sweep_expires_only_issued() {
    let db = setup_test_db().await;
    let now = Utc::now();
    let www = seed_domain(&db, "www.example.com", "alice").await;

    for (serial, status, days) in [
        ("01", CertificateStatus::Issued, -1),
        ("02", CertificateStatus::Issued, 10),
        ("03", CertificateStatus::Applied, -1),
        ("04", CertificateStatus::Revoked, -1),
    ] {
        seed_certificate(
            &db,
            SeedCertificate {
                serial: Some(serial),
                status,
                not_after: Some(now + Duration::days(days)),
                ..Default::default()
            },
            &[&www],
        )
        .await;
    }

    let sweep = ExpirySweep::new(db.clone());
    assert_eq!(sweep.run(now).await.unwrap(), 1);
    assert_eq!(sweep.run(now).await.unwrap(), 0);

    let statuses: Vec<(String, CertificateStatus)> = certificate::Entity::find()
        .all(&db)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.serial.unwrap_or_default(), c.status))
        .collect();
    assert!(statuses.contains(&("01".to_string(), CertificateStatus::Expired)));
    assert!(statuses.contains(&("02".to_string(), CertificateStatus::Issued)));
    assert!(statuses.contains(&("03".to_string(), CertificateStatus::Applied)));
    assert!(statuses.contains(&("04".to_string(), CertificateStatus::Revoked)));
}
