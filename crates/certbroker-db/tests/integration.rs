//! Integration tests for certbroker-db
//!
//! Exercises the schema and model hooks against an in-memory SQLite database

use certbroker_db::entities::{certificate, certificate_domain, delegation, domain};
use certbroker_db::{connect, migrate, CertificateStatus, CertificateType};
use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, ModelTrait, PaginatorTrait,
    QueryFilter, Set,
};

/// Helper to create a test database
async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

async fn insert_domain(db: &sea_orm::DatabaseConnection, fqdn: &str, approved: bool) -> domain::Model {
    let now = Utc::now();
    domain::ActiveModel {
        fqdn: Set(fqdn.to_string()),
        owner: Set("alice".to_string()),
        approved: Set(approved),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert domain")
}

async fn insert_certificate(
    db: &sea_orm::DatabaseConnection,
    serial: &str,
    status: CertificateStatus,
) -> certificate::Model {
    let now = Utc::now();
    certificate::ActiveModel {
        ssl_id: Set(Some(1001)),
        serial: Set(Some(serial.to_string())),
        common_name: Set("www.example.com".to_string()),
        status: Set(status),
        certificate_type: Set(CertificateType::Ssl),
        not_before: Set(Some(now)),
        not_after: Set(Some(now + Duration::days(90))),
        issued_by: Set("alice".to_string()),
        source: Set("api".to_string()),
        created: Set(Some(now)),
        csr: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to insert certificate")
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let result = migrate(&db).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_domain_fqdn_is_unique() {
    let db = setup_test_db().await;

    insert_domain(&db, "example.com", false).await;

    let now = Utc::now();
    let duplicate = domain::ActiveModel {
        fqdn: Set("example.com".to_string()),
        owner: Set("bob".to_string()),
        approved: Set(false),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&db)
    .await;

    assert!(duplicate.is_err());
}

#[tokio::test]
async fn test_domain_rejects_empty_fqdn() {
    let db = setup_test_db().await;

    let now = Utc::now();
    let result = domain::ActiveModel {
        fqdn: Set("  ".to_string()),
        owner: Set("alice".to_string()),
        approved: Set(false),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&db)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_domain_approval_never_reverts() {
    let db = setup_test_db().await;

    let domain = insert_domain(&db, "example.com", false).await;

    let mut active = domain.into_active_model();
    active.approved = Set(true);
    let approved = active.update(&db).await.expect("approve");
    assert!(approved.approved);

    let mut active = approved.into_active_model();
    active.approved = Set(false);
    assert!(active.update(&db).await.is_err());
}

#[tokio::test]
async fn test_delegations_cascade_with_domain() {
    let db = setup_test_db().await;

    let domain = insert_domain(&db, "example.com", true).await;
    delegation::ActiveModel {
        user: Set("bob".to_string()),
        domain_id: Set(domain.id),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(&db)
    .await
    .expect("insert delegation");

    domain.delete(&db).await.expect("delete domain");

    let remaining = delegation::Entity::find().count(&db).await.unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_certificate_delete_is_forbidden() {
    let db = setup_test_db().await;

    let cert = insert_certificate(&db, "aa01", CertificateStatus::Issued).await;

    let result = cert.into_active_model().delete(&db).await;
    assert!(result.is_err());

    let count = certificate::Entity::find().count(&db).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_issued_certificate_serial_is_immutable() {
    let db = setup_test_db().await;

    let cert = insert_certificate(&db, "aa02", CertificateStatus::Issued).await;

    let mut active = cert.clone().into_active_model();
    active.serial = Set(Some("bb02".to_string()));
    assert!(active.update(&db).await.is_err());

    let mut active = cert.into_active_model();
    active.not_after = Set(Some(Utc::now() + Duration::days(400)));
    assert!(active.update(&db).await.is_err());
}

#[tokio::test]
async fn test_illegal_status_transition_is_rejected() {
    let db = setup_test_db().await;

    let cert = insert_certificate(&db, "aa03", CertificateStatus::Issued).await;

    let mut active = cert.into_active_model();
    active.status = Set(CertificateStatus::Revoked);
    let revoked = active.update(&db).await.expect("revoke");
    assert_eq!(revoked.status, CertificateStatus::Revoked);

    let mut active = revoked.into_active_model();
    active.status = Set(CertificateStatus::Issued);
    assert!(active.update(&db).await.is_err());
}

#[tokio::test]
async fn test_certificate_domain_edges() {
    let db = setup_test_db().await;

    let cert = insert_certificate(&db, "aa04", CertificateStatus::Issued).await;
    let www = insert_domain(&db, "www.example.com", false).await;
    let apex = insert_domain(&db, "example.com", false).await;

    for domain_id in [www.id, apex.id] {
        certificate_domain::ActiveModel {
            certificate_id: Set(cert.id),
            domain_id: Set(domain_id),
        }
        .insert(&db)
        .await
        .expect("insert edge");
    }

    let mut sans: Vec<String> = cert
        .find_related(domain::Entity)
        .all(&db)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.fqdn)
        .collect();
    sans.sort();
    assert_eq!(sans, vec!["example.com", "www.example.com"]);

    let covering = apex
        .find_related(certificate::Entity)
        .filter(certificate::Column::Status.eq(CertificateStatus::Issued))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(covering.len(), 1);
    assert_eq!(covering[0].serial.as_deref(), Some("aa04"));
}
