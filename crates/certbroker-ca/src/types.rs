//! Request and response bodies of the CA REST API

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Organization, certificate profile and term used for one kind of enrollment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EnrollmentProfile {
    pub org_id: i64,
    pub cert_type: i64,
    /// Validity in days
    pub term: i64,
}

impl Default for EnrollmentProfile {
    fn default() -> Self {
        Self {
            org_id: 0,
            cert_type: 0,
            term: 365,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslEnrollRequest {
    pub org_id: i64,
    pub csr: String,
    pub cert_type: i64,
    pub term: i64,
    /// Comma separated SAN list
    #[serde(rename = "subjAltNames")]
    pub subj_alt_names: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Who asked for the certificate; read back as `requester` on details
    pub external_requester: String,
}

impl SslEnrollRequest {
    pub fn new(profile: &EnrollmentProfile, csr: &str, sans: &[String], requester: &str) -> Self {
        Self {
            org_id: profile.org_id,
            csr: csr.to_string(),
            cert_type: profile.cert_type,
            term: profile.term,
            subj_alt_names: sans.join(","),
            comments: None,
            external_requester: requester.to_string(),
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslEnrollResponse {
    pub ssl_id: i64,
    #[serde(default)]
    pub renew_id: Option<String>,
}

/// Entry of the paginated certificate listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslListItem {
    pub ssl_id: i64,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslPage {
    pub items: Vec<SslListItem>,
    /// Total number of certificates across all pages, when the CA reports it
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslCertificateDetails {
    pub ssl_id: i64,
    pub common_name: String,
    /// CA status text, e.g. `Issued`, `Applied`, `Revoked`
    pub status: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub subject_alternative_names: Vec<String>,
    /// Missing for certificates issued over ACME
    #[serde(default)]
    pub requested: Option<NaiveDate>,
    #[serde(default)]
    pub expires: Option<NaiveDate>,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub external_requester: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl SslCertificateDetails {
    /// Common name plus SANs, deduplicated, in CA order
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::with_capacity(self.subject_alternative_names.len() + 1);
        for name in std::iter::once(&self.common_name).chain(&self.subject_alternative_names) {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !domains.contains(&name) {
                domains.push(name);
            }
        }
        domains
    }

    /// Requester as recorded by the CA, preferring the external requester
    pub fn issued_by(&self) -> String {
        self.external_requester
            .as_deref()
            .filter(|r| !r.is_empty())
            .or(self.requester.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmimeEnrollRequest {
    pub org_id: i64,
    pub csr: String,
    pub cert_type: i64,
    pub term: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_emails: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmimeEnrollResponse {
    pub order_number: i64,
    pub backend_cert_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub reason: String,
}

/// Validation state of one domain as listed by the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcvValidation {
    pub domain: String,
    pub dcv_status: String,
    #[serde(default)]
    pub dcv_order_status: Option<String>,
    #[serde(default)]
    pub dcv_method: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
}

impl DcvValidation {
    pub fn is_validated(&self) -> bool {
        is_validated(&self.dcv_status)
    }

    /// Not validated, or validation lapses before `horizon`
    pub fn needs_validation(&self, horizon: NaiveDate) -> bool {
        !self.is_validated() || self.expiration_date.is_some_and(|expires| expires <= horizon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DomainRequest<'a> {
    pub domain: &'a str,
}

/// CNAME the CA wants published: `host` must point at `point`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnameChallenge {
    pub host: String,
    pub point: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcvSubmitResult {
    pub status: String,
    #[serde(default)]
    pub order_status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcvStatus {
    pub status: String,
    #[serde(default)]
    pub order_status: Option<String>,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
}

impl DcvStatus {
    pub fn is_validated(&self) -> bool {
        is_validated(&self.status)
    }
}

fn is_validated(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case("validated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_deserialize() {
        let details: SslCertificateDetails = serde_json::from_str(
            r#"{
                "sslId": 1234,
                "commonName": "www.example.com",
                "status": "Issued",
                "serialNumber": "7D:2A:9F",
                "subjectAlternativeNames": ["www.example.com", "API.example.com"],
                "requested": "2026-01-15",
                "expires": "2027-01-15",
                "requester": "ops",
                "externalRequester": "alice@example.com"
            }"#,
        )
        .unwrap();

        assert_eq!(details.ssl_id, 1234);
        assert_eq!(details.domains(), vec!["www.example.com", "api.example.com"]);
        assert_eq!(details.requested, NaiveDate::from_ymd_opt(2026, 1, 15));
        assert_eq!(details.issued_by(), "alice@example.com");
    }

    #[test]
    fn test_details_without_requested() {
        let details: SslCertificateDetails = serde_json::from_str(
            r#"{"sslId": 1, "commonName": "acme.example.com", "status": "Issued", "requester": "acme"}"#,
        )
        .unwrap();
        assert!(details.requested.is_none());
        assert!(details.subject_alternative_names.is_empty());
        assert_eq!(details.issued_by(), "acme");
    }

    #[test]
    fn test_enroll_request_serialization() {
        let profile = EnrollmentProfile {
            org_id: 7,
            cert_type: 42,
            term: 365,
        };
        let sans = vec!["a.example.com".to_string(), "b.example.com".to_string()];
        let body = serde_json::to_value(SslEnrollRequest::new(&profile, "CSR", &sans, "alice")).unwrap();

        assert_eq!(body["orgId"], 7);
        assert_eq!(body["certType"], 42);
        assert_eq!(body["subjAltNames"], "a.example.com,b.example.com");
        assert_eq!(body["externalRequester"], "alice");
        assert!(body.get("comments").is_none());
    }

    #[test]
    fn test_dcv_needs_validation() {
        let horizon = NaiveDate::from_ymd_opt(2026, 11, 15).unwrap();
        let mut validation = DcvValidation {
            domain: "example.com".into(),
            dcv_status: "VALIDATED".into(),
            dcv_order_status: None,
            dcv_method: Some("CNAME".into()),
            expiration_date: NaiveDate::from_ymd_opt(2027, 6, 1),
        };
        assert!(!validation.needs_validation(horizon));

        validation.expiration_date = NaiveDate::from_ymd_opt(2026, 11, 1);
        assert!(validation.needs_validation(horizon));

        validation.dcv_status = "NOT_VALIDATED".into();
        validation.expiration_date = None;
        assert!(validation.needs_validation(horizon));
    }
}
