use certbroker_cert::{CertificateRecord, IssuedCertificate, RevokeOutcome};
use certbroker_db::entities::{delegation, domain, eab_account};
use certbroker_dns::{DnsRecord, RecordChange};
use certbroker_domain::{
    DomainEntry, EabCredentials, EabPermissionCheck, PermissionCheck, Permissions,
    RegistrationStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Safe, human-readable description
    pub error: String,
    /// Stable machine-readable code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

/// A registered domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Domain {
    pub id: i32,
    pub fqdn: String,
    /// Owning user, empty for names registered implicitly as certificate SANs
    pub owner: String,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<domain::Model> for Domain {
    fn from(d: domain::Model) -> Self {
        Self {
            id: d.id,
            fqdn: d.fqdn,
            owner: d.owner,
            approved: d.approved,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// What the caller may do with a domain
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct DomainPermissions {
    pub can_delete: bool,
    pub can_transfer: bool,
    pub can_delegate: bool,
    pub can_approve: bool,
}

impl From<Permissions> for DomainPermissions {
    fn from(p: Permissions) -> Self {
        Self {
            can_delete: p.can_delete,
            can_transfer: p.can_transfer,
            can_delegate: p.can_delegate,
            can_approve: p.can_approve,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Delegation {
    pub id: i32,
    /// Delegated user
    pub user: String,
    pub domain_id: i32,
    pub created_at: DateTime<Utc>,
}

impl From<delegation::Model> for Delegation {
    fn from(d: delegation::Model) -> Self {
        Self {
            id: d.id,
            user: d.user,
            domain_id: d.domain_id,
            created_at: d.created_at,
        }
    }
}

/// A domain as seen by the caller
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainDetail {
    #[serde(flatten)]
    pub domain: Domain,
    pub permissions: DomainPermissions,
    pub delegations: Vec<Delegation>,
}

impl From<DomainEntry> for DomainDetail {
    fn from(entry: DomainEntry) -> Self {
        Self {
            domain: entry.domain.into(),
            permissions: entry.permissions.into(),
            delegations: entry.delegations.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainList {
    pub domains: Vec<DomainDetail>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateDomainRequest {
    /// Fully qualified domain name, e.g. "www.example.com"
    pub fqdn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferDomainRequest {
    /// User that becomes the new owner
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateDelegationRequest {
    /// User receiving owner-equivalent rights
    pub user: String,
}

/// A list of names to check
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NamesRequest {
    pub fqdns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PermissionResult {
    pub fqdn: String,
    pub granted: bool,
}

impl From<PermissionCheck> for PermissionResult {
    fn from(c: PermissionCheck) -> Self {
        Self {
            fqdn: c.fqdn,
            granted: c.granted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PermissionResultList {
    pub results: Vec<PermissionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegistrationResult {
    pub fqdn: String,
    pub registered: bool,
    pub approved: bool,
}

impl From<RegistrationStatus> for RegistrationResult {
    fn from(s: RegistrationStatus) -> Self {
        Self {
            fqdn: s.fqdn,
            registered: s.registered,
            approved: s.approved,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegistrationResultList {
    pub results: Vec<RegistrationResult>,
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

/// A resource record in presentation format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Record {
    /// Owner name, absolute or relative to the zone
    pub name: String,
    /// Record type, e.g. "A", "CNAME", "TXT"
    #[serde(rename = "type")]
    pub record_type: String,
    /// RDATA in zone-file syntax
    pub content: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_ttl() -> u32 {
    certbroker_dns::record::DEFAULT_TTL
}

impl From<DnsRecord> for Record {
    fn from(r: DnsRecord) -> Self {
        Self {
            name: r.name,
            record_type: r.record_type,
            content: r.content,
            ttl: r.ttl,
        }
    }
}

impl From<Record> for DnsRecord {
    fn from(r: Record) -> Self {
        DnsRecord::new(r.name, r.record_type, r.content, r.ttl)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordList {
    pub zone: String,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordsRequest {
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordUpdate {
    pub old: Record,
    pub new: Record,
}

impl From<RecordUpdate> for RecordChange {
    fn from(u: RecordUpdate) -> Self {
        RecordChange {
            old: u.old.into(),
            new: u.new.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateRecordsRequest {
    /// Each old record is removed before its replacement is added
    pub changes: Vec<RecordUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ZoneList {
    /// Configured zones the caller controls
    pub zones: Vec<String>,
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A certificate as stored by the broker
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Certificate {
    pub id: i32,
    /// Normalized serial (lowercase hex), absent until issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// CA-side order id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_id: Option<i64>,
    pub common_name: String,
    /// Lifecycle state, e.g. "Issued", "Revoked"
    pub status: String,
    /// "ssl" or "smime"
    pub certificate_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub issued_by: String,
    pub source: String,
    /// SAN names
    pub domains: Vec<String>,
}

impl From<CertificateRecord> for Certificate {
    fn from(record: CertificateRecord) -> Self {
        let c = record.certificate;
        Self {
            id: c.id,
            serial: c.serial,
            ssl_id: c.ssl_id,
            common_name: c.common_name,
            status: c.status.to_string(),
            certificate_type: c.certificate_type.to_string(),
            not_before: c.not_before,
            not_after: c.not_after,
            issued_by: c.issued_by,
            source: c.source,
            domains: record.domains,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CertificateList {
    pub certificates: Vec<Certificate>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueCertificateRequest {
    /// PKCS#10 request in PEM format (RSA >= 2048 bits)
    pub csr: String,
    /// Names the certificate must cover
    pub sans: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueCertificateResponse {
    pub certificate: Certificate,
    /// Leaf first, PEM encoded
    pub chain_pem: String,
}

impl From<IssuedCertificate> for IssueCertificateResponse {
    fn from(issued: IssuedCertificate) -> Self {
        Self {
            certificate: issued.record.into(),
            chain_pem: issued.chain_pem,
        }
    }
}

/// Revoke by serial or by common name. Exactly one must be set.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevokeCertificateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevokeResponse {
    /// Serials revoked, or "#<id>" for requests closed before issuance
    pub revoked: Vec<String>,
}

impl From<RevokeOutcome> for RevokeResponse {
    fn from(outcome: RevokeOutcome) -> Self {
        Self {
            revoked: outcome.revoked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueSmimeRequest {
    /// PKCS#10 request in PEM format
    pub csr: String,
    /// Defaults to the first word of the caller's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Defaults to the rest of the caller's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub secondary_emails: Vec<String>,
}

/// Revoke one of the caller's S/MIME certificates by serial, or all of them
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevokeSmimeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default)]
    pub all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// EAB
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateEabRequest {
    #[serde(default)]
    pub comment: String,
}

/// Newly created EAB key. The HMAC key is only ever shown here.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EabCredentialsResponse {
    pub key_id: String,
    /// Base64url-encoded HMAC key
    pub hmac_key: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

impl From<EabCredentials> for EabCredentialsResponse {
    fn from(c: EabCredentials) -> Self {
        Self {
            key_id: c.key_id,
            hmac_key: c.hmac_key,
            comment: c.comment,
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EabAccount {
    pub key_id: String,
    pub comment: String,
    /// ACME account URL once bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_account: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<eab_account::Model> for EabAccount {
    fn from(a: eab_account::Model) -> Self {
        Self {
            key_id: a.id,
            comment: a.comment,
            bound_account: a.bound_account,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EabAccountList {
    pub accounts: Vec<EabAccount>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindEabRequest {
    /// ACME account URL the key was used for
    pub account_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResolveAccountRequest {
    /// EAB key id or bound ACME account URL
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResolveAccountResponse {
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckEabRequest {
    /// EAB key id or bound ACME account URL
    pub id: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EabPermissionResult {
    pub user: String,
    pub allowed: bool,
    /// Requested names not covered by an approved domain of the user
    pub missing: Vec<String>,
}

impl From<EabPermissionCheck> for EabPermissionResult {
    fn from(c: EabPermissionCheck) -> Self {
        Self {
            user: c.user,
            allowed: c.allowed,
            missing: c.missing,
        }
    }
}
