#![allow(dead_code)]

use std::time::Duration;

use certbroker_ca::{CaError, CODE_ALREADY_REVOKED, CODE_STILL_PROCESSING};
use certbroker_cert::IssuanceSettings;
use certbroker_db::entities::{certificate, certificate_domain, domain};
use certbroker_db::{connect, migrate, CertificateStatus, CertificateType};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

pub const CSR_RSA2048: &str = include_str!("../fixtures/csr_rsa2048.pem");
pub const CSR_RSA1024: &str = include_str!("../fixtures/csr_rsa1024.pem");
pub const CSR_EC: &str = include_str!("../fixtures/csr_ec.pem");
pub const CHAIN: &str = include_str!("../fixtures/chain.pem");
pub const LEAF_SERIAL: &str = "7d2a9f0c11e4b3a85c6d0e1f22334455";

pub async fn setup_test_db() -> DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    db
}

pub fn fast_settings() -> IssuanceSettings {
    IssuanceSettings {
        collect_timeout: Duration::from_secs(2),
        collect_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn still_processing() -> CaError {
    CaError::Api {
        status: 400,
        code: CODE_STILL_PROCESSING,
        description: "Being processed by Sectigo".into(),
    }
}

pub fn already_revoked() -> CaError {
    CaError::Api {
        status: 400,
        code: CODE_ALREADY_REVOKED,
        description: "Certificate is already revoked".into(),
    }
}

pub fn rejected(description: &str) -> CaError {
    CaError::Api {
        status: 400,
        code: -1,
        description: description.into(),
    }
}

pub async fn seed_domain(db: &DatabaseConnection, fqdn: &str, owner: &str) -> domain::Model {
    let now = Utc::now();
    domain::ActiveModel {
        fqdn: Set(fqdn.to_string()),
        owner: Set(owner.to_string()),
        approved: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to seed domain")
}

pub struct SeedCertificate<'a> {
    pub ssl_id: Option<i64>,
    pub serial: Option<&'a str>,
    pub common_name: &'a str,
    pub status: CertificateStatus,
    pub kind: CertificateType,
    pub not_after: Option<DateTime<Utc>>,
    pub issued_by: &'a str,
}

impl Default for SeedCertificate<'_> {
    fn default() -> Self {
        Self {
            ssl_id: None,
            serial: None,
            common_name: "www.example.com",
            status: CertificateStatus::Issued,
            kind: CertificateType::Ssl,
            not_after: None,
            issued_by: "alice@example.com",
        }
    }
}

pub async fn seed_certificate(
    db: &DatabaseConnection,
    seed: SeedCertificate<'_>,
    sans: &[&domain::Model],
) -> certificate::Model {
    let now = Utc::now();
    let cert = certificate::ActiveModel {
        ssl_id: Set(seed.ssl_id),
        serial: Set(seed.serial.map(str::to_string)),
        common_name: Set(seed.common_name.to_string()),
        status: Set(seed.status),
        certificate_type: Set(seed.kind),
        not_before: Set(Some(now)),
        not_after: Set(seed.not_after),
        issued_by: Set(seed.issued_by.to_string()),
        source: Set("test".to_string()),
        created: Set(Some(now)),
        csr: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to seed certificate");

    for san in sans {
        certificate_domain::ActiveModel {
            certificate_id: Set(cert.id),
            domain_id: Set(san.id),
        }
        .insert(db)
        .await
        .expect("Failed to link SAN");
    }
    cert
}
