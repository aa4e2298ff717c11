//! Client for the commercial CA that issues every certificate
//!
//! The [`CertificateAuthority`] trait is the seam the orchestrators depend on;
//! [`HttpCaClient`] talks to the CA's REST API.

pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

pub use client::{CaConfig, HttpCaClient};
pub use error::{CaError, CODE_ALREADY_REVOKED, CODE_STILL_PROCESSING};
pub use types::{
    CnameChallenge, DcvStatus, DcvSubmitResult, DcvValidation, EnrollmentProfile,
    SmimeEnrollRequest, SmimeEnrollResponse, SslCertificateDetails, SslEnrollRequest,
    SslEnrollResponse, SslListItem, SslPage,
};

/// Operations consumed from the CA
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn enroll_ssl(&self, request: &SslEnrollRequest) -> Result<SslEnrollResponse, CaError>;

    /// PEM chain of an issued order. Fails with a still-processing error
    /// (see [`CaError::is_still_processing`]) until the CA is done.
    async fn collect_ssl(&self, ssl_id: i64) -> Result<String, CaError>;

    async fn revoke_ssl(&self, ssl_id: i64, reason: &str) -> Result<(), CaError>;

    async fn revoke_ssl_by_serial(&self, serial: &str, reason: &str) -> Result<(), CaError>;

    /// One page of the certificate inventory, `position` is the offset
    async fn list_ssl(&self, size: u32, position: u32) -> Result<SslPage, CaError>;

    async fn ssl_details(&self, ssl_id: i64) -> Result<SslCertificateDetails, CaError>;

    async fn find_ssl_by_serial(&self, serial: &str) -> Result<Option<SslListItem>, CaError>;

    async fn enroll_smime(&self, request: &SmimeEnrollRequest) -> Result<SmimeEnrollResponse, CaError>;

    async fn collect_smime(&self, backend_cert_id: &str) -> Result<String, CaError>;

    async fn revoke_smime_by_serial(&self, serial: &str, reason: &str) -> Result<(), CaError>;

    async fn list_dcv(&self, size: u32, position: u32) -> Result<Vec<DcvValidation>, CaError>;

    async fn start_cname_validation(&self, domain: &str) -> Result<CnameChallenge, CaError>;

    async fn submit_cname_validation(&self, domain: &str) -> Result<DcvSubmitResult, CaError>;

    async fn dcv_status(&self, domain: &str) -> Result<DcvStatus, CaError>;
}
