//! Issuance and revocation against a mocked CA

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use certbroker_ca::{CaError, MockCertificateAuthority, SmimeEnrollResponse, SslEnrollResponse};
use certbroker_cert::{
    CancellationToken, CertError, CertificateOrchestrator, IssueRequest, RevokeSelector,
    SmimeIssueRequest, SmimeOrchestrator, SmimeRevokeSelector,
};
use certbroker_db::entities::{certificate, domain};
use certbroker_db::{CertificateStatus, CertificateType};
use certbroker_domain::ErrorKind;
use chrono::{Datelike, Utc};
use common::*;
use mockall::predicate::eq;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

fn request(csr: &str) -> IssueRequest {
    IssueRequest {
        csr: csr.to_string(),
        sans: vec!["WWW.example.com".into(), "example.com".into()],
        issuer: "alice".into(),
        requester: None,
        source: "api".into(),
        comments: None,
    }
}

#[tokio::test]
async fn test_issue_polls_until_collected() {
    let db = setup_test_db().await;
    let mut ca = MockCertificateAuthority::new();

    ca.expect_enroll_ssl()
        .withf(|req| req.subj_alt_names == "www.example.com,example.com" && req.external_requester == "alice")
        .times(1)
        .returning(|_| {
            Ok(SslEnrollResponse {
                ssl_id: 42,
                renew_id: None,
            })
        });

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    ca.expect_collect_ssl().with(eq(42)).returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(still_processing())
        } else {
            Ok(CHAIN.to_string())
        }
    });

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let issued = orchestrator
        .issue(request(CSR_RSA2048), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(issued.chain_pem.contains("BEGIN CERTIFICATE"));

    let cert = &issued.record.certificate;
    assert_eq!(cert.status, CertificateStatus::Issued);
    assert_eq!(cert.ssl_id, Some(42));
    assert_eq!(cert.serial.as_deref(), Some(LEAF_SERIAL));
    assert_eq!(cert.common_name, "www.example.com");
    assert_eq!(cert.issued_by, "alice");
    assert_eq!(cert.created, cert.not_before);
    assert_eq!(cert.not_after.map(|t| t.year()), Some(2027));
    assert_eq!(issued.record.domains, vec!["example.com", "www.example.com"]);

    // SAN domains were created for the requester, unapproved
    let domains = domain::Entity::find().all(&db).await.unwrap();
    assert_eq!(domains.len(), 2);
    assert!(domains.iter().all(|d| d.owner == "alice" && !d.approved));
}

#[tokio::test]
async fn test_issue_records_requester_and_approves_under_owned_root() {
    let db = setup_test_db().await;
    seed_domain(&db, "example.com", "alice").await;

    let mut ca = MockCertificateAuthority::new();
    ca.expect_enroll_ssl()
        .withf(|req| req.external_requester == "alice@example.com")
        .times(1)
        .returning(|_| {
            Ok(SslEnrollResponse {
                ssl_id: 43,
                renew_id: None,
            })
        });
    ca.expect_collect_ssl().with(eq(43)).returning(|_| Ok(CHAIN.to_string()));

    let mut req = request(CSR_RSA2048);
    req.requester = Some(" alice@example.com ".into());
    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let issued = orchestrator.issue(req, &CancellationToken::new()).await.unwrap();
    assert_eq!(issued.record.certificate.issued_by, "alice@example.com");

    // the new SAN sits under alice's approved root
    let www = domain::Entity::find()
        .filter(domain::Column::Fqdn.eq("www.example.com"))
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(www.owner, "alice");
    assert!(www.approved);
}

#[tokio::test]
async fn test_issue_rejects_bad_csr_before_calling_ca() {
    let db = setup_test_db().await;
    // No expectations: any CA call panics
    let orchestrator =
        CertificateOrchestrator::new(db.clone(), Arc::new(MockCertificateAuthority::new()), fast_settings());
    let cancel = CancellationToken::new();

    for csr in [CSR_RSA1024, CSR_EC, "not a csr", CHAIN] {
        let err = orchestrator.issue(request(csr), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "{}", err);
    }

    let mut empty = request(CSR_RSA2048);
    empty.sans.clear();
    let err = orchestrator.issue(empty, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert!(certificate::Entity::find().all(&db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_collect_timeout_leaves_applied_row_and_blocks_duplicates() {
    let db = setup_test_db().await;
    let mut ca = MockCertificateAuthority::new();
    ca.expect_enroll_ssl().times(1).returning(|_| {
        Ok(SslEnrollResponse {
            ssl_id: 7,
            renew_id: None,
        })
    });
    ca.expect_collect_ssl().returning(|_| Err(still_processing()));

    let mut settings = fast_settings();
    settings.collect_timeout = Duration::from_millis(100);
    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), settings);
    let cancel = CancellationToken::new();

    let err = orchestrator.issue(request(CSR_RSA2048), &cancel).await.unwrap_err();
    match &err {
        CertError::Timeout { last, .. } => {
            assert!(last.as_deref().unwrap_or_default().contains("-1400"), "{:?}", last)
        }
        other => panic!("expected timeout, got {}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let rows = certificate::Entity::find().all(&db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, CertificateStatus::Applied);
    assert_eq!(rows[0].ssl_id, Some(7));

    // Same CSR again while the first order is in flight
    let err = orchestrator.issue(request(CSR_RSA2048), &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_enroll_refusal_marks_row_rejected() {
    let db = setup_test_db().await;
    let mut ca = MockCertificateAuthority::new();
    ca.expect_enroll_ssl()
        .times(1)
        .returning(|_| Err(rejected("Domain is not allowed")));

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let err = orchestrator
        .issue(request(CSR_RSA2048), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamRejected);

    let rows = certificate::Entity::find().all(&db).await.unwrap();
    assert_eq!(rows[0].status, CertificateStatus::Rejected);
}

#[tokio::test]
async fn test_enroll_outage_keeps_row_requested() {
    let db = setup_test_db().await;
    let mut ca = MockCertificateAuthority::new();
    ca.expect_enroll_ssl()
        .times(1)
        .returning(|_| Err(CaError::Transport("connection reset".into())));

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let err = orchestrator
        .issue(request(CSR_RSA2048), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);

    let rows = certificate::Entity::find().all(&db).await.unwrap();
    assert_eq!(rows[0].status, CertificateStatus::Requested);
}

#[tokio::test]
async fn test_revoke_by_common_name_attempts_every_certificate() {
    let db = setup_test_db().await;
    let www = seed_domain(&db, "www.example.com", "alice").await;
    for ssl_id in 1..=5 {
        let serial = format!("0{}", ssl_id);
        seed_certificate(
            &db,
            SeedCertificate {
                ssl_id: Some(ssl_id),
                serial: Some(&serial),
                ..Default::default()
            },
            &[&www],
        )
        .await;
    }
    // Already gone; must not be attempted
    seed_certificate(
        &db,
        SeedCertificate {
            ssl_id: Some(6),
            serial: Some("06"),
            status: CertificateStatus::Revoked,
            ..Default::default()
        },
        &[&www],
    )
    .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut ca = MockCertificateAuthority::new();
    ca.expect_revoke_ssl()
        .withf(|_, reason| reason == "keyCompromise")
        .returning(move |ssl_id, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            match ssl_id {
                3 => Err(rejected("revocation refused")),
                4 => Err(already_revoked()),
                _ => Ok(()),
            }
        });

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let err = orchestrator
        .revoke(
            &RevokeSelector::CommonName("WWW.example.com".into()),
            "keyCompromise",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    match &err {
        CertError::Aggregate { total, failures } => {
            assert_eq!(*total, 5);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].item, "03");
        }
        other => panic!("expected aggregate error, got {}", other),
    }
    assert_eq!(err.kind(), ErrorKind::UpstreamRejected);

    let still_issued: Vec<String> = certificate::Entity::find()
        .filter(certificate::Column::Status.eq(CertificateStatus::Issued))
        .all(&db)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|c| c.serial)
        .collect();
    assert_eq!(still_issued, vec!["03"]);
}

#[tokio::test]
async fn test_revoke_by_common_name_all_succeed() {
    let db = setup_test_db().await;
    let www = seed_domain(&db, "www.example.com", "alice").await;
    for serial in ["0a", "0b"] {
        seed_certificate(
            &db,
            SeedCertificate {
                ssl_id: Some(i64::from_str_radix(serial, 16).unwrap()),
                serial: Some(serial),
                ..Default::default()
            },
            &[&www],
        )
        .await;
    }

    let mut ca = MockCertificateAuthority::new();
    ca.expect_revoke_ssl().times(2).returning(|_, _| Ok(()));

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let mut outcome = orchestrator
        .revoke(
            &RevokeSelector::CommonName("www.example.com".into()),
            "superseded",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    outcome.revoked.sort();
    assert_eq!(outcome.revoked, vec!["0a", "0b"]);

    let err = orchestrator
        .revoke(
            &RevokeSelector::CommonName("www.example.com".into()),
            "superseded",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_revoke_by_serial_is_idempotent() {
    let db = setup_test_db().await;
    let www = seed_domain(&db, "www.example.com", "alice").await;
    seed_certificate(
        &db,
        SeedCertificate {
            ssl_id: Some(9),
            serial: Some("abcd01"),
            ..Default::default()
        },
        &[&www],
    )
    .await;

    let mut ca = MockCertificateAuthority::new();
    ca.expect_revoke_ssl_by_serial()
        .withf(|serial, _| serial == "abcd01")
        .times(1)
        .returning(|_, _| Err(already_revoked()));

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let outcome = orchestrator
        .revoke(
            &RevokeSelector::Serial("AB:CD:01".into()),
            "unspecified",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.revoked, vec!["abcd01"]);

    let row = certificate::Entity::find().one(&db).await.unwrap().unwrap();
    assert_eq!(row.status, CertificateStatus::Revoked);
}

#[tokio::test]
async fn test_cancel_during_collection() {
    let db = setup_test_db().await;
    let mut ca = MockCertificateAuthority::new();
    ca.expect_enroll_ssl().returning(|_| {
        Ok(SslEnrollResponse {
            ssl_id: 5,
            renew_id: None,
        })
    });
    ca.expect_collect_ssl().returning(|_| Err(still_processing()));

    let orchestrator = CertificateOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orchestrator.issue(request(CSR_RSA2048), &cancel).await.unwrap_err();
    assert!(matches!(err, CertError::Canceled), "{}", err);
}

#[tokio::test]
async fn test_smime_issue_list_and_revoke() {
    let db = setup_test_db().await;
    let mut ca = MockCertificateAuthority::new();
    ca.expect_enroll_smime()
        .withf(|req| req.email == "alice@example.com" && req.first_name == "Alice")
        .times(1)
        .returning(|_| {
            Ok(SmimeEnrollResponse {
                order_number: 900,
                backend_cert_id: "b-900".into(),
            })
        });
    ca.expect_collect_smime()
        .withf(|id| id == "b-900")
        .returning(|_| Ok(CHAIN.to_string()));
    ca.expect_revoke_smime_by_serial()
        .withf(|serial, _| serial == LEAF_SERIAL)
        .times(1)
        .returning(|_, _| Ok(()));

    let orchestrator = SmimeOrchestrator::new(db.clone(), Arc::new(ca), fast_settings());
    let cancel = CancellationToken::new();

    let issued = orchestrator
        .issue(
            SmimeIssueRequest {
                csr: CSR_RSA2048.to_string(),
                email: "Alice@Example.com".into(),
                first_name: "Alice".into(),
                last_name: "Example".into(),
                secondary_emails: Vec::new(),
                issuer: "alice".into(),
            },
            &cancel,
        )
        .await
        .unwrap();

    let cert = &issued.record.certificate;
    assert_eq!(cert.certificate_type, CertificateType::Smime);
    assert_eq!(cert.common_name, "alice@example.com");
    assert_eq!(cert.ssl_id, Some(900));
    assert_eq!(cert.status, CertificateStatus::Issued);

    let listed = orchestrator.list("alice@example.com").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(orchestrator.list("bob@example.com").await.unwrap().is_empty());
    assert!(orchestrator
        .owned_by(LEAF_SERIAL, "alice@example.com")
        .await
        .unwrap()
        .is_some());

    let outcome = orchestrator
        .revoke(
            &SmimeRevokeSelector::Email("alice@example.com".into()),
            "superseded",
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(outcome.revoked, vec![LEAF_SERIAL]);

    let row = certificate::Entity::find().one(&db).await.unwrap().unwrap();
    assert_eq!(row.status, CertificateStatus::Revoked);
    assert!(row.updated_at <= Utc::now());
}
